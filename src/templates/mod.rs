//! Contract template registry.
//!
//! Every contract the factories deploy is an instance of one of a closed set
//! of templates. A template descriptor fixes:
//! - the view functions that make up the instance's on-chain state
//! - the read strategy (fixed: all-or-nothing, dynamic: per-field null)
//! - the creation event that announces new instances
//! - the participant roles its deployment config can carry
//! - how a lifecycle code is derived from a state snapshot, and which codes
//!   are still worth reconciling

use crate::store::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field name → encoded value, as read from chain.
pub type StateMap = BTreeMap<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown template: {0}")]
pub struct UnknownTemplate(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateId {
    LegacyRental,
    RentVault,
    GroupBuyEscrow,
    StableAllowanceTreasury,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Every field must read successfully or the whole snapshot fails.
    Fixed,
    /// A failed field is recorded as null; the snapshot itself never fails.
    Dynamic,
}

/// A zero-argument view function and its Solidity return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewFunction {
    pub name: &'static str,
    pub output: &'static str,
}

impl ViewFunction {
    pub const fn new(name: &'static str, output: &'static str) -> Self {
        Self { name, output }
    }

    /// Canonical signature used for selector computation, e.g. `rentAmount()`.
    pub fn signature(&self) -> String {
        format!("{}()", self.name)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDescriptor {
    pub id: TemplateId,
    pub display_name: &'static str,
    pub read_mode: ReadMode,
    pub fields: &'static [ViewFunction],
    pub creation_event: &'static str,
    pub roles: &'static [Role],
    pub lifecycle_labels: &'static [&'static str],
    pub non_terminal: &'static [u8],
}

// ─── Descriptor table ────────────────────────────────────────────────────────

const LEGACY_RENTAL_FIELDS: &[ViewFunction] = &[
    ViewFunction::new("landlord", "address"),
    ViewFunction::new("tenant", "address"),
    ViewFunction::new("monthlyAmount", "uint256"),
    ViewFunction::new("totalMonths", "uint8"),
    ViewFunction::new("startTime", "uint256"),
    ViewFunction::new("state", "uint8"),
    ViewFunction::new("terminationNoticeTime", "uint256"),
];

const RENT_VAULT_FIELDS: &[ViewFunction] = &[
    ViewFunction::new("recipient", "address"),
    ViewFunction::new("rentAmount", "uint256"),
    ViewFunction::new("dueDate", "uint256"),
    ViewFunction::new("totalDeposited", "uint256"),
    ViewFunction::new("withdrawn", "bool"),
];

const GROUP_BUY_ESCROW_FIELDS: &[ViewFunction] = &[
    ViewFunction::new("recipient", "address"),
    ViewFunction::new("fundingGoal", "uint256"),
    ViewFunction::new("expiryDate", "uint256"),
    ViewFunction::new("totalDeposited", "uint256"),
    ViewFunction::new("goalReachedAt", "uint256"),
    ViewFunction::new("deliveryConfirmedAt", "uint256"),
    ViewFunction::new("deliveryProof", "string"),
    ViewFunction::new("released", "bool"),
    ViewFunction::new("yesVotes", "uint256"),
    ViewFunction::new("participantCount", "uint256"),
    ViewFunction::new("needsMajority", "uint256"),
    ViewFunction::new("timelockRefundDelay", "uint256"),
];

const TREASURY_FIELDS: &[ViewFunction] = &[
    ViewFunction::new("owner", "address"),
    ViewFunction::new("recipient", "address"),
    ViewFunction::new("allowancePerIncrement", "uint256"),
    ViewFunction::new("approvalCounter", "uint256"),
    ViewFunction::new("claimedCount", "uint256"),
    ViewFunction::new("state", "uint8"),
    ViewFunction::new("treasuryBalance", "uint256"),
    ViewFunction::new("unclaimedAllowances", "uint256"),
];

static LEGACY_RENTAL: TemplateDescriptor = TemplateDescriptor {
    id: TemplateId::LegacyRental,
    display_name: "Rental agreement (legacy factory)",
    read_mode: ReadMode::Fixed,
    fields: LEGACY_RENTAL_FIELDS,
    creation_event: "RentalDeployed(address,address,address,address,string)",
    roles: &[Role::Creator, Role::Recipient, Role::Tenant],
    lifecycle_labels: &["Deployed", "Active", "Completed", "TerminationPending", "Terminated"],
    non_terminal: &[0, 1, 3],
};

static RENT_VAULT: TemplateDescriptor = TemplateDescriptor {
    id: TemplateId::RentVault,
    display_name: "Rent vault",
    read_mode: ReadMode::Dynamic,
    fields: RENT_VAULT_FIELDS,
    creation_event: "RentVaultCreated(address,address,address)",
    roles: &[Role::Creator, Role::Recipient, Role::Tenant],
    lifecycle_labels: &["Collecting", "Withdrawn"],
    non_terminal: &[0],
};

static GROUP_BUY_ESCROW: TemplateDescriptor = TemplateDescriptor {
    id: TemplateId::GroupBuyEscrow,
    display_name: "Group buy escrow",
    read_mode: ReadMode::Dynamic,
    fields: GROUP_BUY_ESCROW_FIELDS,
    creation_event: "GroupBuyEscrowCreated(address,address,address)",
    roles: &[Role::Creator, Role::Recipient, Role::Participant],
    lifecycle_labels: &["Funding", "GoalReached", "Released"],
    non_terminal: &[0, 1],
};

static STABLE_ALLOWANCE_TREASURY: TemplateDescriptor = TemplateDescriptor {
    id: TemplateId::StableAllowanceTreasury,
    display_name: "Stable allowance treasury",
    read_mode: ReadMode::Dynamic,
    fields: TREASURY_FIELDS,
    creation_event: "TreasuryCreated(address,address,address)",
    roles: &[Role::Creator, Role::Owner, Role::Recipient],
    lifecycle_labels: &["Active", "Paused", "Terminated"],
    non_terminal: &[0, 1],
};

impl TemplateId {
    pub const ALL: [TemplateId; 4] = [
        TemplateId::LegacyRental,
        TemplateId::RentVault,
        TemplateId::GroupBuyEscrow,
        TemplateId::StableAllowanceTreasury,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateId::LegacyRental => "legacy-rental",
            TemplateId::RentVault => "rent-vault",
            TemplateId::GroupBuyEscrow => "group-buy-escrow",
            TemplateId::StableAllowanceTreasury => "stable-allowance-treasury",
        }
    }

    pub fn descriptor(self) -> &'static TemplateDescriptor {
        match self {
            TemplateId::LegacyRental => &LEGACY_RENTAL,
            TemplateId::RentVault => &RENT_VAULT,
            TemplateId::GroupBuyEscrow => &GROUP_BUY_ESCROW,
            TemplateId::StableAllowanceTreasury => &STABLE_ALLOWANCE_TREASURY,
        }
    }

    /// All registered descriptors, in declaration order.
    pub fn all() -> impl Iterator<Item = &'static TemplateDescriptor> {
        Self::ALL.into_iter().map(TemplateId::descriptor)
    }

    /// Derive the lifecycle code for a fresh snapshot. Falls back to
    /// `previous` when the fields the code depends on could not be read.
    pub fn lifecycle_of(self, state: &StateMap, previous: u8) -> u8 {
        match self {
            TemplateId::LegacyRental | TemplateId::StableAllowanceTreasury => state
                .get("state")
                .and_then(Value::as_u64)
                .and_then(|code| u8::try_from(code).ok())
                .unwrap_or(previous),
            TemplateId::RentVault => match state.get("withdrawn").and_then(Value::as_bool) {
                Some(true) => 1,
                Some(false) => 0,
                None => previous,
            },
            TemplateId::GroupBuyEscrow => {
                let released = state.get("released").and_then(Value::as_bool);
                let goal_reached = state.get("goalReachedAt").and_then(is_nonzero);
                match (released, goal_reached) {
                    (Some(true), _) => 2,
                    (Some(false), Some(true)) => 1,
                    (Some(false), Some(false)) => 0,
                    _ => previous,
                }
            }
        }
    }

    pub fn is_terminal(self, code: u8) -> bool {
        !self.descriptor().non_terminal.contains(&code)
    }
}

/// Large integers arrive as decimal strings, small ones as numbers.
fn is_nonzero(value: &Value) -> Option<bool> {
    match value {
        Value::String(s) => Some(s != "0"),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateId {
    type Err = UnknownTemplate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownTemplate(s.to_string()))
    }
}
