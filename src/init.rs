//! Project initialization for testman
//!
//! `testman init` creates the `.testman` directory, a starter configuration
//! and the database with every realm's tables.

use crate::config::Config;
use crate::db::Database;
use colored::Colorize;
use std::fs;
use std::path::Path;

/// Starter configuration written by `testman init`
pub const DEFAULT_CONFIG: &str = r#"# testman configuration

# Custom fields of test cases: `name = type`, attributes as "name.<attr>".
# Types: text, textarea, select, radio, checkbox, time
[testcase-custom]
priority = "select"
"priority.label" = "Priority"
"priority.options" = "|low|medium|high"
"priority.order" = 1

# Workflow of test cases: `action = "old states -> new state"`
[testcase-resource_workflow]
submit = "new -> review"
"submit.permissions" = "TEST_MODIFY"
"submit.default" = 2
approve = "review -> approved"
"approve.permissions" = "TEST_ADMIN"
"approve.default" = 1
reject = "review -> new"
"reject.permissions" = "TEST_ADMIN"
"#;

/// Initialize testman in the current directory
pub fn init_project() -> Result<(), String> {
    let cwd = std::env::current_dir().map_err(|e| format!("Could not get current directory: {}", e))?;
    init_project_at(&cwd)
}

pub fn init_project_at(cwd: &Path) -> Result<(), String> {
    println!("\n{}", "Initializing testman...".cyan().bold());
    println!("   Directory: {}\n", cwd.display());

    // 1. Create .testman directory
    let testman_dir = cwd.join(".testman");
    create_dir_if_missing(&testman_dir)?;

    // 2. Starter configuration
    let config_path = testman_dir.join("config.toml");
    write_file_if_missing(&config_path, DEFAULT_CONFIG, ".testman/config.toml")?;
    let config = Config::load_from(&config_path).map_err(|e| e.to_string())?;

    // 3. Database and realm tables; TESTMAN_DB_PATH still wins when set
    let db_path = std::env::var("TESTMAN_DB_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| testman_dir.join("testman.db"));
    let db = Database::open_at(&db_path).map_err(|e| e.to_string())?;
    let env = crate::standard_environment(db, config);
    let report = env.ensure_schema().map_err(|e| e.to_string())?;
    if report.is_empty() {
        println!("   {} {} (tables already exist)", "Skipping".yellow(), db_path.display());
    } else {
        for table in &report.created_tables {
            println!("   {} table {}", "Creating".green(), table);
        }
    }

    // 4. Keep the database out of version control
    add_to_gitignore(cwd)?;

    println!("\n{}", "testman initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Edit {} to declare custom fields and workflows", ".testman/config.toml".cyan());
    println!("  2. Run {} to list the fields of a realm", "testman fields testcase".cyan());
    println!();

    Ok(())
}

fn create_dir_if_missing(path: &Path) -> Result<(), String> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| format!("Could not create {}: {}", path.display(), e))?;
        println!("   {} {}", "Creating".green(), path.display());
    }
    Ok(())
}

fn write_file_if_missing(path: &Path, content: &str, display_name: &str) -> Result<(), String> {
    if path.exists() {
        println!("   {} {} (already exists)", "Skipping".yellow(), display_name);
    } else {
        fs::write(path, content).map_err(|e| format!("Could not write {}: {}", display_name, e))?;
        println!("   {} {}", "Creating".green(), display_name);
    }
    Ok(())
}

fn add_to_gitignore(cwd: &Path) -> Result<(), String> {
    let gitignore_path = cwd.join(".gitignore");
    let entry = ".testman/testman.db";

    if gitignore_path.exists() {
        let existing =
            fs::read_to_string(&gitignore_path).map_err(|e| format!("Could not read .gitignore: {}", e))?;
        if existing.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        let new_content = format!("{}\n\n# testman database (local)\n{}\n", existing.trim_end(), entry);
        fs::write(&gitignore_path, new_content).map_err(|e| format!("Could not update .gitignore: {}", e))?;
        println!("   {} .gitignore (added {})", "Updated".green(), entry);
    } else {
        let content = format!("# testman database (local)\n{}\n", entry);
        fs::write(&gitignore_path, content).map_err(|e| format!("Could not create .gitignore: {}", e))?;
        println!("   {} .gitignore", "Creating".green());
    }
    Ok(())
}
