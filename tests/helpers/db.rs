use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Create a test course with the given rosters
pub async fn seed_course(
    db: &DatabaseConnection,
    course_id: &str,
    students: &[&str],
    staff: &[&str],
) -> ondemand::entities::course::Model {
    let students: Vec<String> = students.iter().map(|s| s.to_string()).collect();
    let staff: Vec<String> = staff.iter().map(|s| s.to_string()).collect();
    ondemand::storage::create_course(
        db,
        course_id,
        "Test Course",
        &students,
        &staff,
        "dGVzdDp0b2tlbg==",
    )
    .await
    .expect("Failed to create test course")
}

/// Create a test assignment spanning the given grading period
pub async fn seed_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    max_runs: i64,
    quota: &str,
    start: i64,
    end: i64,
) -> ondemand::entities::assignment::Model {
    ondemand::storage::add_assignment(
        db,
        course_id,
        assignment_id,
        max_runs,
        quota,
        start,
        end,
        "visible",
    )
    .await
    .expect("Failed to create test assignment")
}
