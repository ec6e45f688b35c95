//! Listing metadata for offered resources.
//!
//! The catalog holds what owners describe (title, category, location...).
//! Unit counts and status belong to the waitlist ledger; [`ResourceView`]
//! joins both for read-only callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::waitlist::LedgerSnapshot;
use crate::core::MatchError;
use crate::util::clock::days_between;
use crate::util::serde::{Category, Condition, ResourceId};

const DAY_MS: u128 = 24 * 60 * 60 * 1000;

fn embedding_text(title: &str, location: &str, condition: Condition, description: &str) -> String {
    [title, location, condition.label(), description].join(" ")
}

/// Period during which the owner offers the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    /// First available moment (ms since epoch).
    pub start_ms: u128,
    /// Last available moment (ms since epoch).
    pub end_ms: u128,
}

/// Listing submitted by an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
    /// Owner identifier.
    pub owner_id: String,
    /// Short title.
    pub title: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Category.
    pub category: Category,
    /// Pick-up location.
    pub location: String,
    /// Item condition.
    pub condition: Condition,
    /// Owner-assigned rating, 0–5.
    pub rating: u8,
    /// Optional availability window.
    #[serde(default)]
    pub availability: Option<AvailabilityWindow>,
}

impl NewListing {
    /// Listing with required fields; condition `Good`, rating 3.
    pub fn new(
        owner_id: impl Into<String>,
        title: impl Into<String>,
        category: Category,
        location: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            title: title.into(),
            description: String::new(),
            category,
            location: location.into(),
            condition: Condition::Good,
            rating: 3,
            availability: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the condition.
    #[must_use]
    pub const fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Set the rating.
    #[must_use]
    pub const fn with_rating(mut self, rating: u8) -> Self {
        self.rating = rating;
        self
    }

    /// Set the availability window.
    #[must_use]
    pub const fn with_availability(mut self, start_ms: u128, end_ms: u128) -> Self {
        self.availability = Some(AvailabilityWindow { start_ms, end_ms });
        self
    }

    /// Text the listing will be embedded from.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.title, &self.location, self.condition, &self.description)
    }

    /// Reject empty title/location, ratings above 5 and windows that are
    /// inverted or begin before today.
    pub fn validate(&self, now_ms: u128) -> Result<(), MatchError> {
        if self.title.trim().is_empty() || self.location.trim().is_empty() {
            return Err(MatchError::InvalidListing(
                "title and location are required".into(),
            ));
        }
        if self.rating > 5 {
            return Err(MatchError::InvalidListing(format!(
                "rating must be 0-5, got {}",
                self.rating
            )));
        }
        if let Some(window) = self.availability {
            if window.start_ms > window.end_ms {
                return Err(MatchError::InvalidListing(
                    "start date must be before or equal to end date".into(),
                ));
            }
            if window.start_ms / DAY_MS < now_ms / DAY_MS {
                return Err(MatchError::InvalidListing("dates cannot be in the past".into()));
            }
        }
        Ok(())
    }
}

/// A listed resource's descriptive record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Resource identifier.
    pub id: ResourceId,
    /// Owner identifier.
    pub owner_id: String,
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Category.
    pub category: Category,
    /// Pick-up location.
    pub location: String,
    /// Item condition.
    pub condition: Condition,
    /// Rating, 0–5.
    pub rating: u8,
    /// Optional availability window.
    pub availability: Option<AvailabilityWindow>,
    /// When the listing was created.
    pub listed_at_ms: u128,
    /// When the description last changed.
    pub updated_at_ms: u128,
}

impl Listing {
    /// Text fed to the embedder: title, location, condition, description.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.title, &self.location, self.condition, &self.description)
    }

    /// Length of the availability window in whole days (0 when open-ended).
    pub fn availability_days(&self) -> u64 {
        self.availability
            .map_or(0, |w| days_between(w.start_ms, w.end_ms))
    }

    /// Combined `category_condition` feature key.
    pub fn category_condition(&self) -> String {
        format!("{}_{}", self.category.label(), self.condition.label())
    }
}

/// Listing joined with its ledger state: the full resource record.
#[derive(Debug, Clone)]
pub struct ResourceView {
    /// Descriptive record.
    pub listing: Arc<Listing>,
    /// Units and status.
    pub ledger: LedgerSnapshot,
    /// Current embedding, if stored.
    pub embedding: Option<Arc<Vec<f32>>>,
}

/// Thread-safe listing registry with id allocation.
pub struct ResourceCatalog {
    listings: RwLock<HashMap<ResourceId, Arc<Listing>>>,
    next_id: AtomicU64,
}

impl Default for ResourceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCatalog {
    /// Empty catalog; ids start at 1.
    pub fn new() -> Self {
        Self {
            listings: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Validate and store a new listing under a fresh id.
    pub fn insert(&self, new: NewListing, now_ms: u128) -> Result<Arc<Listing>, MatchError> {
        new.validate(now_ms)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listing = Arc::new(Listing {
            id,
            owner_id: new.owner_id,
            title: new.title,
            description: new.description,
            category: new.category,
            location: new.location,
            condition: new.condition,
            rating: new.rating,
            availability: new.availability,
            listed_at_ms: now_ms,
            updated_at_ms: now_ms,
        });
        self.listings.write().insert(id, Arc::clone(&listing));
        Ok(listing)
    }

    /// Replace the description of a listing.
    pub fn update_description(
        &self,
        id: ResourceId,
        description: impl Into<String>,
        now_ms: u128,
    ) -> Result<Arc<Listing>, MatchError> {
        let mut listings = self.listings.write();
        let current = listings.get(&id).ok_or(MatchError::UnknownResource(id))?;
        let mut updated = Listing::clone(current);
        updated.description = description.into();
        updated.updated_at_ms = now_ms;
        let updated = Arc::new(updated);
        listings.insert(id, Arc::clone(&updated));
        Ok(updated)
    }

    /// Look up a listing.
    pub fn get(&self, id: ResourceId) -> Option<Arc<Listing>> {
        self.listings.read().get(&id).cloned()
    }

    /// Every listing, ordered by id.
    pub fn listings(&self) -> Vec<Arc<Listing>> {
        let mut all: Vec<Arc<Listing>> = self.listings.read().values().cloned().collect();
        all.sort_unstable_by_key(|l| l.id);
        all
    }

    /// Number of listings ever created (withdrawn included).
    pub fn len(&self) -> usize {
        self.listings.read().len()
    }

    /// True when nothing has been listed.
    pub fn is_empty(&self) -> bool {
        self.listings.read().is_empty()
    }
}
