use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// The scheduler daemon's durable job queue. Rows survive daemon restarts;
/// that durability is a hard requirement, not an optimization.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "scheduler_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: String,
    /// When to fire, UNIX timestamp
    pub fire_time: i64,
    pub course_id: String,
    pub assignment_id: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
