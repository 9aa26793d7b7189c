use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "grading_runs")]
pub struct Model {
    /// Backend-assigned run id
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub netid: String,
    pub timestamp: i64,
    /// Extension consumed by this run, if the base quota was exhausted
    pub extension_used: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
