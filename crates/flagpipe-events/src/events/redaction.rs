//! Private attribute index.
//!
//! A trie over attribute reference components. Built once from the configured
//! private attribute list and only read afterwards, so it can be shared across
//! tasks behind an `Arc` without locking.

use std::collections::HashMap;

use flagpipe_common::Reference;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Set when a configured reference ends at this node.
    terminal: Option<Reference>,
}

/// Outcome of looking up an attribute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// Nothing at or below the path is private.
    NotPrivate,
    /// The path (or one of its ancestors) is private.
    Private(&'a Reference),
    /// The path itself is not private but some descendant is.
    DescendantsPrivate,
}

impl Lookup<'_> {
    pub fn is_private(&self) -> bool {
        matches!(self, Lookup::Private(_))
    }

    pub fn has_private_descendants(&self) -> bool {
        matches!(self, Lookup::DescendantsPrivate)
    }
}

/// Immutable trie of private attribute references.
#[derive(Debug, Default)]
pub struct AttributeRedactionIndex {
    root: Node,
}

impl AttributeRedactionIndex {
    pub fn new(references: &[Reference]) -> Self {
        let mut root = Node::default();
        for reference in references {
            let mut node = &mut root;
            for component in reference.components() {
                node = node.children.entry(component.clone()).or_default();
            }
            if node.terminal.is_none() {
                node.terminal = Some(reference.clone());
            }
        }
        Self { root }
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Walk the trie along `path`.
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Lookup<'_> {
        let mut node = &self.root;
        for component in path {
            match node.children.get(component.as_ref()) {
                None => return Lookup::NotPrivate,
                Some(child) => {
                    if let Some(reference) = &child.terminal {
                        return Lookup::Private(reference);
                    }
                    node = child;
                }
            }
        }
        if node.children.is_empty() {
            Lookup::NotPrivate
        } else {
            Lookup::DescendantsPrivate
        }
    }
}
