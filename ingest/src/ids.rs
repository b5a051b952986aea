use std::{collections::HashMap, hash::Hash};

use uuid::Uuid;

use crate::model::*;

pub trait Mint {
    fn mint() -> Self;
}

impl Mint for RouteId {
    fn mint() -> Self {
        RouteId(Uuid::new_v4())
    }
}

impl Mint for ServiceId {
    fn mint() -> Self {
        ServiceId(Uuid::new_v4())
    }
}

impl Mint for StopId {
    fn mint() -> Self {
        StopId(Uuid::new_v4())
    }
}

pub type ServiceKey = (RouteId, Option<ServiceTag>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StopKey {
    pub route_id: RouteId,
    pub tag: StopTag,
    pub location: Option<PointKey>,
}

impl StopKey {
    pub fn new(route_id: RouteId, tag: StopTag, location: Option<Point>) -> Self {
        StopKey {
            route_id,
            tag,
            location: location.map(|point| point.key()),
        }
    }
}

/// Surrogate ids loaded from the store. Unknown keys get a fresh id that is
/// remembered, so a key always resolves to the same id.
#[derive(Debug)]
pub struct IdTable<K, V> {
    ids: HashMap<K, V>,
    minted: usize,
}

impl<K: Eq + Hash, V: Copy + Mint> IdTable<K, V> {
    pub fn new(existing: HashMap<K, V>) -> Self {
        IdTable {
            ids: existing,
            minted: 0,
        }
    }

    pub fn resolve(&mut self, key: K) -> V {
        let minted = &mut self.minted;
        *self.ids.entry(key).or_insert_with(|| {
            *minted += 1;
            V::mint()
        })
    }

    pub fn minted(&self) -> usize {
        self.minted
    }
}
