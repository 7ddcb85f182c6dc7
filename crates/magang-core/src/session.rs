//! Session-scoped view state: active filter criteria and display page.

use serde::{Deserialize, Serialize};

use crate::filter::{derive_facets, reconcile_city, reconcile_criteria, Facets, FilterCriteria};
use crate::Listing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSession {
    pub criteria: FilterCriteria,
    pub page: usize,
}

impl Default for ViewSession {
    fn default() -> Self {
        Self {
            criteria: FilterCriteria::default(),
            page: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaChange {
    Unchanged,
    /// Only in-memory predicates changed; re-filter the current dataset.
    Refiltered,
    /// The region changed; the dataset is stale and a new fetch must start.
    RegionChanged,
}

impl ViewSession {
    /// Replace the criteria. Any actual change resets the page to 1.
    pub fn update_criteria(&mut self, next: FilterCriteria) -> CriteriaChange {
        if next == self.criteria {
            return CriteriaChange::Unchanged;
        }
        let region_changed = next.region != self.criteria.region;
        self.criteria = next;
        self.page = 1;
        if region_changed {
            CriteriaChange::RegionChanged
        } else {
            CriteriaChange::Refiltered
        }
    }

    pub fn set_page(&mut self, page: usize) {
        self.page = page.max(1);
    }

    /// Derive facets for the current dataset and clear selections that no longer exist.
    ///
    /// The city is settled first; companies are then checked against the
    /// facet for the surviving city selection.
    pub fn reconcile(&mut self, listings: &[Listing]) -> Facets {
        let mut facets = derive_facets(listings, &self.criteria);
        let mut changed = reconcile_city(&mut self.criteria, &facets);
        if changed {
            facets = derive_facets(listings, &self.criteria);
        }
        changed |= reconcile_criteria(&mut self.criteria, &facets);
        if changed {
            self.page = 1;
        }
        facets
    }
}
