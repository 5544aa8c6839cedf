//! Fully qualified names addressing nodes in the tree.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Path separator used by [`Fqn::parse`] and the `Display` impl.
pub const SEPARATOR: char = '/';

/// An immutable, ordered sequence of path elements identifying one node.
///
/// The empty sequence is the root. Ordering compares depth first and then
/// the elements lexicographically, so parents always sort before their
/// children and siblings sort by name.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fqn {
    elements: Vec<String>,
}

impl Fqn {
    /// The root of the tree.
    pub fn root() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    /// Build an Fqn from its elements.
    pub fn from_elements<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `/`-separated path. Empty segments are ignored, so `""`,
    /// `"/"` and `"//"` all denote the root.
    pub fn parse(path: &str) -> Self {
        Self::from_elements(path.split(SEPARATOR).filter(|s| !s.is_empty()))
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Number of elements; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.elements.len()
    }

    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.elements.get(index).map(String::as_str)
    }

    /// The last element, or `None` for the root.
    pub fn last_element(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    /// The parent path. The root is its own parent.
    pub fn parent(&self) -> Fqn {
        match self.elements.split_last() {
            Some((_, rest)) => Self {
                elements: rest.to_vec(),
            },
            None => Self::root(),
        }
    }

    /// Path of a direct child of this node.
    pub fn child(&self, name: impl Into<String>) -> Fqn {
        let mut elements = self.elements.clone();
        elements.push(name.into());
        Self { elements }
    }

    /// Append every element of `relative` to this path.
    pub fn join(&self, relative: &Fqn) -> Fqn {
        let mut elements = self.elements.clone();
        elements.extend(relative.elements.iter().cloned());
        Self { elements }
    }

    /// The first `depth` elements of this path.
    pub fn prefix(&self, depth: usize) -> Fqn {
        Self {
            elements: self.elements[..depth.min(self.elements.len())].to_vec(),
        }
    }

    /// The elements in `start..end` as a new path.
    pub fn sub_fqn(&self, start: usize, end: usize) -> Fqn {
        let end = end.min(self.elements.len());
        let start = start.min(end);
        Self {
            elements: self.elements[start..end].to_vec(),
        }
    }

    /// True if `self` is a strict descendant of `ancestor`.
    pub fn is_child_of(&self, ancestor: &Fqn) -> bool {
        self.depth() > ancestor.depth() && self.elements.starts_with(&ancestor.elements)
    }

    /// True if `self` equals `ancestor` or descends from it.
    pub fn is_child_or_equals(&self, ancestor: &Fqn) -> bool {
        self.elements.starts_with(&ancestor.elements)
    }

    /// True if `self` is exactly one level below `parent`.
    pub fn is_direct_child_of(&self, parent: &Fqn) -> bool {
        self.depth() == parent.depth() + 1 && self.is_child_of(parent)
    }

    /// All strict ancestors ordered from the root down to the parent.
    pub fn ancestors(&self) -> Vec<Fqn> {
        (0..self.depth()).map(|d| self.prefix(d)).collect()
    }

    /// Replace the leading `old_ancestor` of this path with `new_ancestor`.
    ///
    /// Returns `self` unchanged if it does not descend from `old_ancestor`.
    pub fn replace_ancestor(&self, old_ancestor: &Fqn, new_ancestor: &Fqn) -> Fqn {
        if !self.is_child_or_equals(old_ancestor) {
            return self.clone();
        }
        let mut elements = new_ancestor.elements.clone();
        elements.extend(self.elements[old_ancestor.depth()..].iter().cloned());
        Self { elements }
    }
}

impl Ord for Fqn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth()
            .cmp(&other.depth())
            .then_with(|| self.elements.cmp(&other.elements))
    }
}

impl PartialOrd for Fqn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "{}", SEPARATOR);
        }
        for element in &self.elements {
            write!(f, "{}{}", SEPARATOR, element)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fqn({})", self)
    }
}

impl From<&str> for Fqn {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<String> for Fqn {
    fn from(path: String) -> Self {
        Self::parse(&path)
    }
}

impl From<&Fqn> for Fqn {
    fn from(fqn: &Fqn) -> Self {
        fqn.clone()
    }
}
