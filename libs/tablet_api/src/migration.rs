use std::fmt;

use crate::tablet::{GlobalTabletId, TabletReplica};

/// A single planned tablet move. The executor is expected to stream the
/// tablet's data to `dst` and drop the replica at `src`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct MigrationInfo {
    pub tablet: GlobalTabletId,
    pub src: TabletReplica,
    pub dst: TabletReplica,
}

impl fmt::Display for MigrationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.tablet, self.src, self.dst)
    }
}

/// Ordered sequence of planned migrations. The order is advisory; the
/// executor may run them in parallel.
#[derive(Clone, Debug, Default)]
pub struct MigrationPlan {
    migrations: Vec<MigrationInfo>,
}

impl MigrationPlan {
    pub fn push(&mut self, migration: MigrationInfo) {
        self.migrations.push(migration);
    }

    pub fn extend(&mut self, other: MigrationPlan) {
        self.migrations.extend(other.migrations);
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationInfo> {
        self.migrations.iter()
    }
}

impl IntoIterator for MigrationPlan {
    type Item = MigrationInfo;
    type IntoIter = std::vec::IntoIter<MigrationInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.into_iter()
    }
}
