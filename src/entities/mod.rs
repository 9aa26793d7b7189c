pub mod assignment;
pub mod course;
pub mod extension;
pub mod grading_run;
pub mod scheduled_run;
pub mod scheduler_job;

pub use assignment::Entity as Assignment;
pub use course::Entity as Course;
pub use extension::Entity as Extension;
pub use grading_run::Entity as GradingRun;
pub use scheduled_run::Entity as ScheduledRun;
pub use scheduler_job::Entity as SchedulerJob;
