use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type MemberId = String;
pub type RecordId = i64;

/// Label used when a member has neither a name nor an email.
pub const UNNAMED_LABEL: &str = "Unnamed";

/// Label used in raw listings for records whose member no longer exists.
pub const UNKNOWN_MEMBER_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Member {
    #[schemars(description = "Opaque unique key of the member row")]
    pub id: MemberId,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    #[schemars(description = "Identity-provider user this member belongs to")]
    pub auth_user_id: Option<String>,
}

impl Member {
    /// Name if present, else email, else a fixed placeholder.
    pub fn display_name(&self) -> &str {
        [self.name.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .unwrap_or(UNNAMED_LABEL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct MealRecord {
    pub id: RecordId,
    pub member_id: MemberId,
    pub date: NaiveDate,

    #[schemars(description = "Non-negative meal units for the day; halves are allowed")]
    pub meal_count: f64,

    #[serde(default)]
    #[schemars(description = "Insertion time, used only for late-submission detection")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PaidFrom {
    #[schemars(description = "Paid out of the shared cash box")]
    #[default]
    Box,

    #[schemars(
        description = "Paid out of a member's own pocket; a matching deposit must exist for the same member, amount and date"
    )]
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct BazarRecord {
    pub id: RecordId,
    pub member_id: MemberId,
    pub item_name: String,
    pub cost: f64,
    pub date: NaiveDate,

    #[serde(default)]
    pub paid_from: PaidFrom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct DepositRecord {
    pub id: RecordId,
    pub member_id: MemberId,
    pub amount: f64,
    pub date: NaiveDate,
}

/// Row shape returned by the privileged aggregate operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RawAggregates {
    #[serde(default)]
    pub total_meals: f64,
    #[serde(default)]
    pub total_bazar: f64,
    #[serde(default)]
    pub total_deposits: f64,
    #[serde(default)]
    pub total_members: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct NewMember {
    pub auth_user_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct NewMeal {
    pub member_id: MemberId,
    pub date: NaiveDate,
    pub meal_count: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct NewBazar {
    pub member_id: MemberId,
    pub item_name: String,
    pub cost: f64,
    pub date: NaiveDate,
    #[serde(default)]
    pub paid_from: PaidFrom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct NewDeposit {
    pub member_id: MemberId,
    pub amount: f64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct BazarUpdate {
    pub item_name: String,
    pub cost: f64,
    pub date: NaiveDate,
    pub paid_from: PaidFrom,
}

/// Optional columns the backing schema may or may not have yet. Supplied once by the
/// data store instead of being guessed from error text on every write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct SchemaCapabilities {
    #[schemars(description = "bazar.paid_from column exists")]
    pub bazar_paid_from: bool,

    #[schemars(description = "meals.created_at column exists")]
    pub meal_created_at: bool,
}

impl Default for SchemaCapabilities {
    fn default() -> Self {
        Self {
            bazar_paid_from: true,
            meal_created_at: true,
        }
    }
}

/// Anything the reporting engine partitions by calendar date.
pub trait DatedRecord {
    fn record_id(&self) -> RecordId;
    fn member_id(&self) -> &str;
    fn date(&self) -> NaiveDate;
}

impl DatedRecord for MealRecord {
    fn record_id(&self) -> RecordId {
        self.id
    }
    fn member_id(&self) -> &str {
        &self.member_id
    }
    fn date(&self) -> NaiveDate {
        self.date
    }
}

impl DatedRecord for BazarRecord {
    fn record_id(&self) -> RecordId {
        self.id
    }
    fn member_id(&self) -> &str {
        &self.member_id
    }
    fn date(&self) -> NaiveDate {
        self.date
    }
}

impl DatedRecord for DepositRecord {
    fn record_id(&self) -> RecordId {
        self.id
    }
    fn member_id(&self) -> &str {
        &self.member_id
    }
    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// The raw rows every derived view is computed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MessSnapshot {
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub meals: Vec<MealRecord>,
    #[serde(default)]
    pub bazar: Vec<BazarRecord>,
    #[serde(default)]
    pub deposits: Vec<DepositRecord>,
}

impl MessSnapshot {
    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == member_id)
    }

    /// Display label for raw listings; orphaned rows get a placeholder.
    pub fn member_label(&self, member_id: &str) -> &str {
        self.member(member_id)
            .map(Member::display_name)
            .unwrap_or(UNKNOWN_MEMBER_LABEL)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MessSnapshot)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
