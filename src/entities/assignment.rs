use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "assignments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub course_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub assignment_id: String,
    pub max_runs: i64,
    /// "daily" | "total"
    pub quota: String,
    /// Grading period start, UNIX timestamp
    pub start: i64,
    /// Grading period end, UNIX timestamp
    pub end: i64,
    /// "visible" | "hidden"
    pub visibility: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
