//! Lazy list of aggregates.
//!
//! A [`ListProxy`] holds ids only. Every element access goes through the
//! engine's `load`, so elements benefit from the identity map and the cache,
//! and ids whose aggregate no longer exists are simply absent.

use amalgam_core::AggregateId;

use crate::aggregate::AggregateRef;
use crate::engine::AggregateEngine;
use crate::error::{EngineError, EngineResult};
use crate::identity_map::UnitOfWork;

/// Something that can be put into a list: an id, or an aggregate whose id
/// is taken.
#[derive(Debug, Clone)]
pub enum ListItem {
    Id(AggregateId),
    Aggregate(AggregateRef),
}

impl ListItem {
    fn into_id(self, aggregate_type: &str) -> EngineResult<AggregateId> {
        match self {
            ListItem::Id(id) => Ok(id),
            ListItem::Aggregate(aggregate) => {
                aggregate.borrow().id().ok_or_else(|| EngineError::MissingId {
                    aggregate_type: aggregate_type.to_string(),
                })
            }
        }
    }
}

impl From<AggregateId> for ListItem {
    fn from(id: AggregateId) -> Self {
        ListItem::Id(id)
    }
}

impl From<&AggregateId> for ListItem {
    fn from(id: &AggregateId) -> Self {
        ListItem::Id(id.clone())
    }
}

impl From<i64> for ListItem {
    fn from(id: i64) -> Self {
        ListItem::Id(id.into())
    }
}

impl From<i32> for ListItem {
    fn from(id: i32) -> Self {
        ListItem::Id(id.into())
    }
}

impl From<&str> for ListItem {
    fn from(id: &str) -> Self {
        ListItem::Id(id.into())
    }
}

impl From<String> for ListItem {
    fn from(id: String) -> Self {
        ListItem::Id(id.into())
    }
}

impl From<AggregateRef> for ListItem {
    fn from(aggregate: AggregateRef) -> Self {
        ListItem::Aggregate(aggregate)
    }
}

impl From<&AggregateRef> for ListItem {
    fn from(aggregate: &AggregateRef) -> Self {
        ListItem::Aggregate(aggregate.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListProxy {
    aggregate_type: String,
    ids: Vec<AggregateId>,
}

impl ListProxy {
    /// Build a list, normalizing aggregates to their ids. Nothing is loaded.
    pub fn new<I, T>(aggregate_type: impl Into<String>, items: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<ListItem>,
    {
        let aggregate_type = aggregate_type.into();
        let ids = items
            .into_iter()
            .map(|item| item.into().into_id(&aggregate_type))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            aggregate_type,
            ids,
        })
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn ids(&self) -> &[AggregateId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn count(&self) -> usize {
        self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Load the element at `index`. `None` past the end or when the
    /// aggregate no longer exists.
    pub fn get(
        &self,
        engine: &AggregateEngine,
        uow: &mut UnitOfWork,
        index: usize,
    ) -> EngineResult<Option<AggregateRef>> {
        match self.ids.get(index) {
            Some(id) => engine.load(uow, &self.aggregate_type, id.clone()),
            None => Ok(None),
        }
    }

    pub fn first(
        &self,
        engine: &AggregateEngine,
        uow: &mut UnitOfWork,
    ) -> EngineResult<Option<AggregateRef>> {
        self.get(engine, uow, 0)
    }

    pub fn last(
        &self,
        engine: &AggregateEngine,
        uow: &mut UnitOfWork,
    ) -> EngineResult<Option<AggregateRef>> {
        match self.ids.len() {
            0 => Ok(None),
            len => self.get(engine, uow, len - 1),
        }
    }

    /// Replace the id at `index`.
    pub fn set(&mut self, index: usize, item: impl Into<ListItem>) -> EngineResult<()> {
        let len = self.ids.len();
        if index >= len {
            return Err(EngineError::IndexOutOfBounds { index, len });
        }
        self.ids[index] = item.into().into_id(&self.aggregate_type)?;
        Ok(())
    }

    /// Remove and return the id at `index`.
    pub fn remove(&mut self, index: usize) -> EngineResult<AggregateId> {
        let len = self.ids.len();
        if index >= len {
            return Err(EngineError::IndexOutOfBounds { index, len });
        }
        Ok(self.ids.remove(index))
    }

    pub fn push(&mut self, item: impl Into<ListItem>) -> EngineResult<()> {
        let id = item.into().into_id(&self.aggregate_type)?;
        self.ids.push(id);
        Ok(())
    }

    /// Fresh forward pass over the list; each call starts at index 0.
    pub fn iter<'a>(
        &'a self,
        engine: &'a AggregateEngine,
        uow: &'a mut UnitOfWork,
    ) -> ListIter<'a> {
        ListIter {
            proxy: self,
            engine,
            uow,
            position: 0,
        }
    }

    /// Load every element that still exists, in order.
    pub fn load_all(
        &self,
        engine: &AggregateEngine,
        uow: &mut UnitOfWork,
    ) -> EngineResult<Vec<AggregateRef>> {
        self.iter(engine, uow).collect()
    }
}

/// Lazy iterator over a [`ListProxy`]. Ids whose aggregate is not found are
/// skipped.
pub struct ListIter<'a> {
    proxy: &'a ListProxy,
    engine: &'a AggregateEngine,
    uow: &'a mut UnitOfWork,
    position: usize,
}

impl Iterator for ListIter<'_> {
    type Item = EngineResult<AggregateRef>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.proxy.ids.get(self.position) {
            self.position += 1;
            match self
                .engine
                .load(self.uow, &self.proxy.aggregate_type, id.clone())
            {
                Ok(Some(aggregate)) => return Some(Ok(aggregate)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.proxy.ids.len() - self.position))
    }
}
