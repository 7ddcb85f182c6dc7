//! In-memory filtering, facet derivation and pagination over an accumulated dataset.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{region_name, Listing, RegionKey};

/// Fixed display page size.
pub const LISTINGS_PER_PAGE: usize = 21;

/// User-chosen predicate values. Empty fields are inactive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    pub program_study: String,
    pub position: String,
    pub region: RegionKey,
    pub city: String,
    pub company: String,
    pub education_level: String,
}

/// Distinct, alphabetically sorted filter options derived from a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets {
    pub cities: Vec<String>,
    pub companies: Vec<String>,
    pub education_levels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSlice<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.trim().to_lowercase())
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn in_region(listing: &Listing, region: Option<&str>) -> bool {
    match region {
        Some(name) => contains_ci(&listing.employer.province, name),
        None => true,
    }
}

/// Derive city, company and education-level facets for the selected region.
///
/// An empty or unknown region code does not restrict the scan. Companies are
/// further restricted to the selected city when one is set.
pub fn derive_facets(listings: &[Listing], criteria: &FilterCriteria) -> Facets {
    let region = region_name(criteria.region.as_str());
    let selected_city = criteria.city.trim();

    let mut cities = BTreeSet::new();
    let mut companies = BTreeSet::new();
    let mut education_levels = BTreeSet::new();

    for listing in listings.iter().filter(|l| in_region(l, region)) {
        let city = listing.employer.city.trim();
        if !city.is_empty() {
            cities.insert(city.to_string());
        }

        let company = listing.employer.name.trim();
        if !company.is_empty() && (selected_city.is_empty() || eq_ci(city, selected_city)) {
            companies.insert(company.to_string());
        }

        education_levels.extend(listing.education_levels());
    }

    Facets {
        cities: cities.into_iter().collect(),
        companies: companies.into_iter().collect(),
        education_levels: education_levels.into_iter().collect(),
    }
}

/// Reset city, company or education-level selections that are absent from `facets`.
///
/// Returns true when any field was cleared.
pub fn reconcile_criteria(criteria: &mut FilterCriteria, facets: &Facets) -> bool {
    let mut changed = false;
    for (value, options) in [
        (&mut criteria.city, &facets.cities),
        (&mut criteria.company, &facets.companies),
        (&mut criteria.education_level, &facets.education_levels),
    ] {
        changed |= clear_if_missing(value, options);
    }
    changed
}

/// Reset the city selection alone when it is absent from `facets`.
///
/// The company facet depends on the selected city, so callers clearing a stale
/// city should re-derive facets before checking the remaining selections.
pub fn reconcile_city(criteria: &mut FilterCriteria, facets: &Facets) -> bool {
    clear_if_missing(&mut criteria.city, &facets.cities)
}

fn clear_if_missing(value: &mut String, options: &[String]) -> bool {
    if value.trim().is_empty() || options.iter().any(|o| eq_ci(o, value.as_str())) {
        return false;
    }
    value.clear();
    true
}

fn matches(listing: &Listing, criteria: &FilterCriteria) -> bool {
    let program = criteria.program_study.trim();
    if !program.is_empty()
        && !listing
            .program_studies()
            .iter()
            .any(|p| contains_ci(p, program))
    {
        return false;
    }

    let position = criteria.position.trim();
    if !position.is_empty() && !contains_ci(&listing.title, position) {
        return false;
    }

    let city = criteria.city.trim();
    if !city.is_empty() && !contains_ci(&listing.employer.city, city) {
        return false;
    }

    let company = criteria.company.trim();
    if !company.is_empty() && !contains_ci(&listing.employer.name, company) {
        return false;
    }

    let level = criteria.education_level.trim();
    if !level.is_empty() && !listing.education_levels().iter().any(|l| eq_ci(l, level)) {
        return false;
    }

    true
}

/// Listings satisfying every non-empty criterion, in dataset order.
pub fn apply_filters<'a>(listings: &'a [Listing], criteria: &FilterCriteria) -> Vec<&'a Listing> {
    listings.iter().filter(|l| matches(l, criteria)).collect()
}

/// Slice `items` into the 1-based `page` of `per_page` items. Out-of-range pages clamp.
pub fn paginate<T: Clone>(items: &[T], page: usize, per_page: usize) -> PageSlice<T> {
    let per_page = per_page.max(1);
    let total_pages = items.len().max(1).div_ceil(per_page);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * per_page;
    PageSlice {
        items: items.iter().skip(start).take(per_page).cloned().collect(),
        page,
        total_pages,
        total_items: items.len(),
    }
}
