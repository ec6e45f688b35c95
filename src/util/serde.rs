//! Shared serializable identifiers and closed enums.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource identifier, unique per listing.
pub type ResourceId = u64;

/// Waitlist entry identifier. Never reused.
pub type EntryId = u64;

/// Requester identifier as supplied by the auth/profile service.
pub type RequesterId = String;

/// Lifecycle status of a listed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Searchable and admitting requests.
    Active,
    /// Owner reduced the unit count to zero; hidden from search, waitlist kept.
    Exhausted,
    /// Soft-deleted by the owner.
    Withdrawn,
}

impl ResourceStatus {
    /// Whether search may return this resource.
    pub const fn is_searchable(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Status of a waitlist entry. Every state except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for a unit.
    Pending,
    /// Granted a unit.
    Allocated,
    /// Withdrawn by the requester or because the resource was withdrawn.
    Cancelled,
    /// Waited longer than the configured maximum.
    Expired,
}

impl EntryStatus {
    /// True for allocated, cancelled and expired.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Resource categories offered by the sharing platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Hand and power tools.
    Tools,
    /// Sports equipment.
    Sports,
    /// Electronics.
    Electronics,
    /// Books.
    Books,
    /// Kitchen equipment.
    Kitchen,
    /// Furniture.
    Furniture,
    /// Bikes, trailers, cars.
    Vehicles,
    /// Musical instruments.
    MusicalInstruments,
    /// Clothing.
    Clothing,
    /// Gardening equipment.
    Gardening,
    /// Toys.
    Toys,
    /// Household appliances.
    Appliances,
    /// Camping and outdoor gear.
    Outdoor,
    /// Anything else.
    Other,
}

impl Category {
    /// Every category, in display order.
    pub const ALL: [Self; 14] = [
        Self::Tools,
        Self::Sports,
        Self::Electronics,
        Self::Books,
        Self::Kitchen,
        Self::Furniture,
        Self::Vehicles,
        Self::MusicalInstruments,
        Self::Clothing,
        Self::Gardening,
        Self::Toys,
        Self::Appliances,
        Self::Outdoor,
        Self::Other,
    ];

    /// Human-readable label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tools => "Tools",
            Self::Sports => "Sports",
            Self::Electronics => "Electronics",
            Self::Books => "Books",
            Self::Kitchen => "Kitchen",
            Self::Furniture => "Furniture",
            Self::Vehicles => "Vehicles",
            Self::MusicalInstruments => "Musical Instruments",
            Self::Clothing => "Clothing",
            Self::Gardening => "Gardening",
            Self::Toys => "Toys",
            Self::Appliances => "Appliances",
            Self::Outdoor => "Outdoor",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Physical condition of a listed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Like new.
    Excellent,
    /// Normal wear.
    Good,
    /// Visible wear, fully usable.
    Fair,
    /// Usable with caveats.
    Poor,
}

impl Condition {
    /// Human-readable label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
            Self::Poor => "Poor",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Requester context supplied by the auth/profile service.
///
/// Consumed opaquely by the ranking model; the engine itself only reads
/// `requester_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterContext {
    /// Requester identity.
    pub requester_id: RequesterId,
    /// Trust tier assigned by the profile service (higher is more trusted).
    #[serde(default)]
    pub trust_tier: u8,
    /// History features (e.g. past borrow count, no-show rate).
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

impl RequesterContext {
    /// Context with only an identity.
    pub fn new(requester_id: impl Into<RequesterId>) -> Self {
        Self {
            requester_id: requester_id.into(),
            trust_tier: 0,
            features: BTreeMap::new(),
        }
    }

    /// Context with no identity or history, for requester-independent scoring.
    pub fn anonymous() -> Self {
        Self::new(String::new())
    }

    /// Set the trust tier.
    #[must_use]
    pub const fn with_trust_tier(mut self, tier: u8) -> Self {
        self.trust_tier = tier;
        self
    }

    /// Add a history feature.
    #[must_use]
    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }
}
