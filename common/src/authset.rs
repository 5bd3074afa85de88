//! Ordered multiset of tagged key parameters.

use crate::{Error, FallibleAllocExt};
use alloc::vec::Vec;
use skm_wire::keymaster::{KeyParam, Tag};

/// An ordered multiset of [`KeyParam`]s.
///
/// Insertion order is preserved and duplicate tags are allowed (repeatable
/// tags such as `PURPOSE` or `USER_SECURE_ID` legitimately occur more than
/// once). Lookup by tag returns the first match; [`AuthorizationSet::all`]
/// visits every match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorizationSet {
    params: Vec<KeyParam>,
}

impl AuthorizationSet {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Append a parameter, preserving insertion order.
    pub fn push(&mut self, param: KeyParam) -> Result<(), Error> {
        self.params.try_push(param)?;
        Ok(())
    }

    /// Append a clone of every parameter in `slice`.
    pub fn try_extend_from_slice(&mut self, slice: &[KeyParam]) -> Result<(), Error> {
        self.params.try_extend_from_slice(slice)?;
        Ok(())
    }

    /// Return the first parameter carrying `tag`, if any.
    pub fn get(&self, tag: Tag) -> Option<&KeyParam> {
        self.params.iter().find(|param| param.tag() == tag)
    }

    /// Return every parameter carrying `tag`, in insertion order.
    pub fn all(&self, tag: Tag) -> impl Iterator<Item = &KeyParam> {
        self.params.iter().filter(move |param| param.tag() == tag)
    }

    /// Return the index of the first parameter carrying `tag`.
    pub fn find(&self, tag: Tag) -> Option<usize> {
        self.params.iter().position(|param| param.tag() == tag)
    }

    /// Indicate whether a parameter equal to `param` (tag and value) is present.
    pub fn contains(&self, param: &KeyParam) -> bool {
        self.params.iter().any(|p| p == param)
    }

    /// Indicate whether any parameter carrying `tag` is present.
    pub fn contains_tag(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    /// Remove the parameter at `idx`, preserving the order of the remainder.
    pub fn erase(&mut self, idx: usize) -> KeyParam {
        self.params.remove(idx)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, KeyParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_vec(self) -> Vec<KeyParam> {
        self.params
    }
}

impl core::ops::Deref for AuthorizationSet {
    type Target = [KeyParam];
    fn deref(&self) -> &[KeyParam] {
        &self.params
    }
}

impl From<Vec<KeyParam>> for AuthorizationSet {
    fn from(params: Vec<KeyParam>) -> Self {
        Self { params }
    }
}

impl From<AuthorizationSet> for Vec<KeyParam> {
    fn from(set: AuthorizationSet) -> Self {
        set.params
    }
}

impl<'a> IntoIterator for &'a AuthorizationSet {
    type Item = &'a KeyParam;
    type IntoIter = core::slice::Iter<'a, KeyParam>;
    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

impl IntoIterator for AuthorizationSet {
    type Item = KeyParam;
    type IntoIter = alloc::vec::IntoIter<KeyParam>;
    fn into_iter(self) -> Self::IntoIter {
        self.params.into_iter()
    }
}
