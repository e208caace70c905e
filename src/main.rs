use anyhow::{anyhow, bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use std::collections::BTreeMap;
use testman::testmanager::{self, TestCase};
use testman::workflow::{PermissionSet, Resource, TransitionRequest, WorkflowSystem};
use testman::{Config, Database, Environment, FieldValue, ObjectKey, PersistentObject};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "testman")]
#[command(author, version, about = "Test case management on variable-fields persistent objects")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create .testman/ with a starter config and the database
    Init,

    /// List the fields of a realm
    Fields {
        realm: String,
        #[arg(long)]
        json: bool,
    },

    /// Show one object
    Show {
        realm: String,
        /// Key as `col=value` pairs; a bare value means `id=<value>`
        #[arg(required = true)]
        key: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// Insert a new object
    Create {
        realm: String,
        #[arg(required = true)]
        key: Vec<String>,
        /// Field assignment `name=value`, repeatable
        #[arg(short, long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
    },

    /// Change fields of an existing object
    Update {
        realm: String,
        #[arg(required = true)]
        key: Vec<String>,
        #[arg(short, long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
        #[arg(short, long, default_value = "anonymous")]
        author: String,
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Delete an object with its custom values and history
    Delete {
        realm: String,
        #[arg(required = true)]
        key: Vec<String>,
    },

    /// List objects whose fields equal every given filter
    Find {
        realm: String,
        /// Filter `name=value`, repeatable
        #[arg(short = 'w', long = "where", value_name = "NAME=VALUE")]
        filters: Vec<String>,
    },

    /// Show the change history of an object
    History {
        realm: String,
        #[arg(required = true)]
        key: Vec<String>,
    },

    /// Create a test catalog
    NewCatalog {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "anonymous")]
        author: String,
    },

    /// Create a test case inside a catalog
    NewTestcase {
        catalog: String,
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "anonymous")]
        author: String,
    },

    /// List the workflow actions available for a resource
    Actions {
        realm: String,
        id: String,
        /// Permission held by the user, repeatable
        #[arg(short, long = "perm")]
        perms: Vec<String>,
    },

    /// Run a workflow action on a resource
    Transition {
        realm: String,
        id: String,
        action: String,
        #[arg(short, long, default_value = "anonymous")]
        author: String,
        #[arg(short, long = "perm")]
        perms: Vec<String>,
        /// Fail unless the resource is still in this state
        #[arg(long)]
        expect: Option<String>,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("TESTMAN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init => testman::init::init_project().map_err(|e| anyhow!(e)),
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "testman", &mut std::io::stdout());
            Ok(())
        }
        Command::Fields { realm, json } => {
            let env = open_env()?;
            let fields = env.catalog().get_fields(&realm)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&*fields)?);
                return Ok(());
            }
            let metadata = env.catalog().get_metadata(&realm)?;
            println!("{} ({})", metadata.label.bold(), realm);
            for field in fields.iter() {
                let kind = if field.custom { "custom".yellow() } else { "standard".normal() };
                println!("  {:<20} {:<10} {:<8} {}", field.name.cyan(), field.field_type.as_str(), kind, field.label);
            }
            Ok(())
        }
        Command::Show { realm, key, json } => {
            let env = open_env()?;
            let obj: PersistentObject = PersistentObject::open(&env, &realm, parse_key(&key)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(obj.values())?);
                return Ok(());
            }
            if !obj.exists() {
                bail!("{} {} not found", realm, obj.key_string());
            }
            print_object(&obj);
            Ok(())
        }
        Command::Create { realm, key, set } => {
            let env = open_env()?;
            let mut obj: PersistentObject = PersistentObject::open(&env, &realm, parse_key(&key)?)?;
            if obj.exists() {
                bail!("{} {} already exists", realm, obj.key_string());
            }
            for (name, value) in parse_assignments(&set)? {
                obj.set(&name, value)?;
            }
            let key = obj.insert()?.ok_or_else(|| anyhow!("insert was vetoed"))?;
            println!("{} {} {}", "Created".green(), realm, key);
            Ok(())
        }
        Command::Update {
            realm,
            key,
            set,
            author,
            comment,
        } => {
            let env = open_env()?;
            let mut obj: PersistentObject = PersistentObject::open(&env, &realm, parse_key(&key)?)?;
            for (name, value) in parse_assignments(&set)? {
                obj.set(&name, value)?;
            }
            if obj.save_changes(&author, comment.as_deref())? {
                println!("{} {} {}", "Updated".green(), realm, obj.key_string());
            } else {
                println!("{} {} {} (nothing changed)", "Skipping".yellow(), realm, obj.key_string());
            }
            Ok(())
        }
        Command::Delete { realm, key } => {
            let env = open_env()?;
            let mut obj: PersistentObject = PersistentObject::open(&env, &realm, parse_key(&key)?)?;
            if !obj.exists() {
                bail!("{} {} not found", realm, obj.key_string());
            }
            obj.delete()?;
            println!("{} {} {}", "Deleted".red(), realm, obj.key_string());
            Ok(())
        }
        Command::Find { realm, filters } => {
            let env = open_env()?;
            let mut template: PersistentObject = PersistentObject::new(&env, &realm)?;
            for (name, value) in parse_assignments(&filters)? {
                template.set(&name, value)?;
            }
            let mut count = 0;
            for obj in template.list_matching()?.iter() {
                let obj = obj?;
                println!("{}", obj.key_string().cyan());
                count += 1;
            }
            eprintln!("{} match(es)", count);
            Ok(())
        }
        Command::History { realm, key } => {
            let env = open_env()?;
            let obj: PersistentObject = PersistentObject::open(&env, &realm, parse_key(&key)?)?;
            let changes = obj.list_changes()?;
            if changes.is_empty() {
                println!("No changes recorded for {} {}", realm, obj.key_string());
            }
            for change in changes {
                println!(
                    "{} {} {}: {} -> {}",
                    change.time.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    change.author.bold(),
                    change.field.cyan(),
                    change.old_value.as_deref().unwrap_or("(unset)"),
                    change.new_value.as_deref().unwrap_or("(unset)")
                );
            }
            Ok(())
        }
        Command::NewCatalog {
            title,
            description,
            author,
        } => {
            let env = open_env()?;
            let catalog = testmanager::create_catalog(&env, &title, &description, &author)?;
            println!(
                "{} catalog {} ({})",
                "Created".green(),
                catalog.get_str("id"),
                catalog.get_str("page_name")
            );
            Ok(())
        }
        Command::NewTestcase {
            catalog,
            title,
            description,
            author,
        } => {
            let env = open_env()?;
            let catalog = testmanager::open_catalog(&env, &catalog)?;
            if !catalog.exists() {
                bail!("catalog {} not found", catalog.key_string());
            }
            let testcase: TestCase = testmanager::create_testcase(&env, &catalog, &title, &description, &author)?;
            println!(
                "{} test case {} ({})",
                "Created".green(),
                testcase.get_str("id"),
                testcase.get_str("page_name")
            );
            Ok(())
        }
        Command::Actions { realm, id, perms } => {
            let env = open_env()?;
            let workflow = WorkflowSystem::builder(&env).build()?;
            let resource = Resource::new(realm, id);
            let perm = PermissionSet::new(perms);
            let state = workflow.state_of(&resource)?;
            println!("{} is in state {}", resource, state.state().bold());
            for action in workflow.available_actions(&resource, Some(&perm))? {
                println!(
                    "  {:<16} {} -> {}",
                    action.action.cyan(),
                    action.name,
                    action.target_state(state.state())
                );
            }
            Ok(())
        }
        Command::Transition {
            realm,
            id,
            action,
            author,
            perms,
            expect,
        } => {
            let env = open_env()?;
            let workflow = WorkflowSystem::builder(&env).build()?;
            let resource = Resource::new(realm, id);
            let perm = PermissionSet::new(perms);
            let mut request = TransitionRequest::new(&author).with_perm(&perm);
            if let Some(expected) = &expect {
                request = request.expecting(expected);
            }
            let new_state = workflow.transition(&resource, &action, &request)?;
            println!("{} {} is now {}", "Transitioned".green(), resource, new_state.bold());
            Ok(())
        }
    }
}

fn open_env() -> anyhow::Result<Environment> {
    let db = Database::open().context("could not open the testman database")?;
    let env = testman::standard_environment(db, Config::load());
    env.ensure_schema()?;
    Ok(env)
}

/// `col=value` pairs; a single bare value is the `id` column
fn parse_key(args: &[String]) -> anyhow::Result<ObjectKey> {
    if let [single] = args {
        if !single.contains('=') {
            return Ok(ObjectKey::id(single.as_str()));
        }
    }
    ObjectKey::parse_pairs(args.iter().map(String::as_str))
        .ok_or_else(|| anyhow!("invalid key {:?}: expected col=value pairs", args))
}

fn parse_assignments(args: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(n, v)| (n.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("invalid assignment '{}': expected name=value", arg))
        })
        .collect()
}

fn print_object(obj: &PersistentObject) {
    println!("{} {}", obj.metadata().label.bold(), obj.key_string().cyan());
    for field in obj.fields() {
        let value = match obj.get(&field.name) {
            FieldValue::Empty => "(unset)".dimmed().to_string(),
            FieldValue::Time(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            other => other.to_string(),
        };
        println!("  {:<20} {}", format!("{}:", field.label), value);
    }
    if let FieldValue::Time(t) = obj.get("changetime") {
        println!("  {:<20} {}", "Modified:", t.format("%Y-%m-%d %H:%M:%S"));
    }
}
