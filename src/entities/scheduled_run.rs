use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "scheduled_runs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_id: String,
    pub course_id: String,
    pub assignment_id: String,
    /// When the trigger fires, UNIX timestamp
    pub run_time: i64,
    /// Student-visible due date handed to the grading backend
    pub due_time: i64,
    /// NULL resolves to the full course roster at fire time; otherwise a
    /// JSON array of netids fixed at schedule time
    pub roster: Option<String>,
    pub name: String,
    /// The external scheduler daemon's handle for this trigger
    pub scheduler_job_id: String,
    /// Set only once the backend run has actually started
    pub backend_run_id: Option<String>,
    /// "scheduled" | "ran" | "failed"
    pub status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
