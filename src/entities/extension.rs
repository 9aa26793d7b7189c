use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "extensions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub course_id: String,
    pub assignment_id: String,
    pub netid: String,
    pub max_runs: i64,
    pub remaining_runs: i64,
    /// Validity window start, UNIX timestamp
    pub start: i64,
    /// Validity window end, UNIX timestamp (inclusive)
    pub end: i64,
    /// Scheduled run created for this extension's own due-date trigger, if any
    pub run_id: Option<String>,
    pub user_requested: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
