use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create courses table
        manager
            .create_table(
                Table::create()
                    .table(Courses::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Courses::CourseId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Courses::Name))
                    .col(string(Courses::StudentIds))
                    .col(string(Courses::StaffIds))
                    .col(string(Courses::BackendToken))
                    .to_owned(),
            )
            .await?;

        // Create assignments table
        manager
            .create_table(
                Table::create()
                    .table(Assignments::Table)
                    .if_not_exists()
                    .col(string(Assignments::CourseId))
                    .col(string(Assignments::AssignmentId))
                    .col(big_integer(Assignments::MaxRuns))
                    .col(string(Assignments::Quota))
                    .col(big_integer(Assignments::Start))
                    .col(big_integer(Assignments::End))
                    .col(string(Assignments::Visibility))
                    .primary_key(
                        Index::create()
                            .col(Assignments::CourseId)
                            .col(Assignments::AssignmentId),
                    )
                    .to_owned(),
            )
            .await?;

        // Create scheduled_runs table
        manager
            .create_table(
                Table::create()
                    .table(ScheduledRuns::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScheduledRuns::RunId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(ScheduledRuns::CourseId))
                    .col(string(ScheduledRuns::AssignmentId))
                    .col(big_integer(ScheduledRuns::RunTime))
                    .col(big_integer(ScheduledRuns::DueTime))
                    .col(string_null(ScheduledRuns::Roster))
                    .col(string(ScheduledRuns::Name))
                    .col(string(ScheduledRuns::SchedulerJobId))
                    .col(string_null(ScheduledRuns::BackendRunId))
                    .col(string(ScheduledRuns::Status))
                    .to_owned(),
            )
            .await?;

        // Fire-time lookup is by the daemon's job handle, not the primary key
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_scheduled_runs_job")
                    .table(ScheduledRuns::Table)
                    .col(ScheduledRuns::SchedulerJobId)
                    .to_owned(),
            )
            .await?;

        // Create extensions table with backend-specific ID type
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(Extensions::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(Extensions::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(Extensions::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(Extensions::CourseId))
                    .col(string(Extensions::AssignmentId))
                    .col(string(Extensions::Netid))
                    .col(big_integer(Extensions::MaxRuns))
                    .col(big_integer(Extensions::RemainingRuns))
                    .col(big_integer(Extensions::Start))
                    .col(big_integer(Extensions::End))
                    .col(string_null(Extensions::RunId))
                    .col(
                        ColumnDef::new(Extensions::UserRequested)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        // Create index on extensions (course_id, assignment_id, netid)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_extensions_student")
                    .table(Extensions::Table)
                    .col(Extensions::CourseId)
                    .col(Extensions::AssignmentId)
                    .col(Extensions::Netid)
                    .to_owned(),
            )
            .await?;

        // Create grading_runs table
        manager
            .create_table(
                Table::create()
                    .table(GradingRuns::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(GradingRuns::RunId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(GradingRuns::CourseId))
                    .col(string(GradingRuns::AssignmentId))
                    .col(string(GradingRuns::Netid))
                    .col(big_integer(GradingRuns::Timestamp))
                    .col(big_integer_null(GradingRuns::ExtensionUsed))
                    .to_owned(),
            )
            .await?;

        // Quota checks scan a student's history for one assignment
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_grading_runs_student")
                    .table(GradingRuns::Table)
                    .col(GradingRuns::CourseId)
                    .col(GradingRuns::AssignmentId)
                    .col(GradingRuns::Netid)
                    .to_owned(),
            )
            .await?;

        // Create scheduler_jobs table (the daemon's durable queue)
        manager
            .create_table(
                Table::create()
                    .table(SchedulerJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SchedulerJobs::JobId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(big_integer(SchedulerJobs::FireTime))
                    .col(string(SchedulerJobs::CourseId))
                    .col(string(SchedulerJobs::AssignmentId))
                    .col(big_integer(SchedulerJobs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create index on scheduler_jobs.fire_time
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_scheduler_jobs_fire")
                    .table(SchedulerJobs::Table)
                    .col(SchedulerJobs::FireTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SchedulerJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(GradingRuns::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Extensions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ScheduledRuns::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Assignments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Courses::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Courses {
    Table,
    CourseId,
    Name,
    StudentIds,
    StaffIds,
    BackendToken,
}

#[derive(DeriveIden)]
enum Assignments {
    Table,
    CourseId,
    AssignmentId,
    MaxRuns,
    Quota,
    Start,
    End,
    Visibility,
}

#[derive(DeriveIden)]
enum ScheduledRuns {
    Table,
    RunId,
    CourseId,
    AssignmentId,
    RunTime,
    DueTime,
    Roster,
    Name,
    SchedulerJobId,
    BackendRunId,
    Status,
}

#[derive(DeriveIden)]
enum Extensions {
    Table,
    Id,
    CourseId,
    AssignmentId,
    Netid,
    MaxRuns,
    RemainingRuns,
    Start,
    End,
    RunId,
    UserRequested,
}

#[derive(DeriveIden)]
enum GradingRuns {
    Table,
    RunId,
    CourseId,
    AssignmentId,
    Netid,
    Timestamp,
    ExtensionUsed,
}

#[derive(DeriveIden)]
enum SchedulerJobs {
    Table,
    JobId,
    FireTime,
    CourseId,
    AssignmentId,
    CreatedAt,
}
