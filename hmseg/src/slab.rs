//! Slab using unsigned integer ids to index into vector of T.
//! Pushing new values returns their id. Removing elements is O(log n),
//! does not reallocate and it does not change existing ids.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    ops::{Index, IndexMut},
};

pub trait SlabId: Debug + Clone + Copy + PartialEq + Eq + PartialOrd + Ord + From<usize> + Into<usize> {}

#[derive(Debug, Clone)]
pub struct Slab<Id: SlabId, T> {
    values: Vec<Option<T>>,
    empty: BTreeSet<Id>,
}

impl<Id: SlabId, T> Default for Slab<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: SlabId, T> Slab<Id, T> {
    pub const fn new() -> Self {
        Self { values: Vec::new(), empty: BTreeSet::new() }
    }

    pub fn push(&mut self, value: T) -> Id {
        if let Some(id) = self.empty.pop_first() {
            self.values[id.into()] = Some(value);
            id
        } else {
            self.values.push(Some(value));
            Id::from(self.values.len() - 1)
        }
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        let value = self.values.get_mut(id.into())?.take();
        if value.is_some() {
            self.empty.insert(id);
        }
        value
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.values.get(id.into()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.values.get_mut(id.into()).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.values.len() - self.empty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.iter().map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.values.iter().enumerate().filter_map(|(i, x)| x.as_ref().map(|x| (Id::from(i), x)))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.values.iter().flatten()
    }
}

impl<Id: SlabId, T> Index<Id> for Slab<Id, T> {
    type Output = T;

    #[track_caller]
    fn index(&self, index: Id) -> &Self::Output {
        self.get(index).unwrap_or_else(|| panic!("Slab index {index:?} is not occupied"))
    }
}

impl<Id: SlabId, T> IndexMut<Id> for Slab<Id, T> {
    #[track_caller]
    fn index_mut(&mut self, index: Id) -> &mut Self::Output {
        self.get_mut(index).unwrap_or_else(|| panic!("Slab index {index:?} is not occupied"))
    }
}

/// Declares `u32` backed id usable as slab key.
macro_rules! slab_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(u32);

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                $name(u32::try_from(value).expect("slab id overflow"))
            }
        }

        impl From<$name> for usize {
            fn from(value: $name) -> Self {
                value.0 as usize
            }
        }

        impl $crate::slab::SlabId for $name {}
    };
}

pub(crate) use slab_id;

#[cfg(test)]
mod tests {
    use super::Slab;

    slab_id! {
        struct TestId;
    }

    #[test]
    fn reuses_removed_ids() {
        let mut slab: Slab<TestId, &str> = Slab::new();
        assert!(slab.is_empty());
        let a = slab.push("a");
        let b = slab.push("b");
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        let c = slab.push("c");
        assert_eq!(a, c);
        assert_eq!(slab[b], "b");
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.ids().collect::<Vec<_>>(), [a, b]);
        assert!(!slab.is_empty());
    }
}
