use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use tenant_lifecycle::{
    app_config::AppConfig,
    config::{ClassConfig, ResourceLimits, UserConfig},
    orchestrator::{BatchOutcome, LifecycleOrchestrator},
    registry::FileRegistry,
    Context, TenantK8sManager,
};

#[derive(Parser)]
#[clap(name = "tenant-lifecycle", version, about = "Provision and deprovision per-user tenant namespaces")]
struct Cli {
    /// Path to a TOML settings file; built-in defaults apply when omitted.
    #[clap(short, long)]
    config: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a single user, prompting for all parameters.
    Create,
    /// Provision a cohort of users from a class descriptor.
    BulkCreate,
    /// Deprovision users by name, or a whole class with --class.
    Delete {
        usernames: Vec<String>,
        #[clap(long)]
        class: Option<String>,
    },
}

fn prompt(label: &str) -> String {
    print!("{}", label);
    let _ = io::stdout().flush();
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
    line.trim().to_string()
}

fn prompt_count(label: &str) -> u32 {
    match prompt(label).parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: expected a number");
            std::process::exit(1);
        }
    }
}

fn prompt_limits(audience: &str) -> ResourceLimits {
    ResourceLimits {
        cpu_limit: prompt(&format!("Enter CPU limit{} (e.g., '5'): ", audience)),
        memory_limit: prompt(&format!(
            "Enter memory limit{} (available options: 2-128): ",
            audience
        )),
        gpu_mem: prompt(&format!(
            "Enter GPU memory limit{} (available options: 1,2): ",
            audience
        )),
        gpu_count: prompt(&format!(
            "Enter GPU count{} (available options: 1-2): ",
            audience
        )),
        storage_limit: prompt(&format!(
            "Enter storage limit{} (available options: 1Gi-1000Gi): ",
            audience
        )),
    }
    .normalized()
}

fn get_user_input() -> UserConfig {
    UserConfig {
        profile_name: prompt("Enter profile name: "),
        user_email: prompt("Enter user email: "),
        username: prompt("Enter username: "),
        password: prompt("Enter password: "),
        limits: prompt_limits(""),
    }
}

fn get_class_input() -> ClassConfig {
    ClassConfig {
        class_name: prompt("Enter class name for class registry: "),
        class_tag: prompt("Enter class tag: "),
        num_users: prompt_count("Enter number of users to create: "),
        limits: prompt_limits(" for all users"),
    }
}

fn report_outcome(verb: &str, outcome: &BatchOutcome) -> i32 {
    println!(
        "{}: {} succeeded, {} failed.",
        verb,
        outcome.succeeded.len(),
        outcome.failed.len()
    );
    for username in &outcome.failed {
        eprintln!("failed: {}", username);
    }
    if outcome.all_succeeded() {
        0
    } else {
        1
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => AppConfig::from_path(path),
        None => AppConfig::default(),
    };

    let logger = hiro_system_kit::log::setup_logger();
    let _guard = hiro_system_kit::log::setup_global_logger(logger.clone());
    let ctx = Context {
        logger: Some(logger),
        tracer: false,
    };

    let manager = TenantK8sManager::default(&ctx)
        .await
        .with_deadlines(settings.deadlines.deadlines());
    let registry = FileRegistry::new(settings.paths.registry_path.clone());
    let mut orchestrator = LifecycleOrchestrator::new(manager, registry, settings, ctx);

    let code = match cli.command {
        Command::Create => {
            let user = get_user_input();
            match orchestrator.create_user(user).await {
                Ok(outcome) if outcome.all_succeeded() => {
                    println!("User creation process completed successfully.");
                    0
                }
                Ok(outcome) => report_outcome("User creation", &outcome),
                Err(e) => {
                    eprintln!(
                        "dex update failed; the user keeps its cluster resources and ledger record: {}",
                        e
                    );
                    1
                }
            }
        }
        Command::BulkCreate => {
            let class = get_class_input();
            let class_name = class.class_name.clone();
            match orchestrator.create_class(class).await {
                Ok(outcome) => report_outcome(
                    &format!("Bulk user creation for class {}", class_name),
                    &outcome,
                ),
                Err(e) => {
                    eprintln!(
                        "dex update failed; created users keep their cluster resources and ledger records: {}",
                        e
                    );
                    1
                }
            }
        }
        Command::Delete { usernames, class } => match (usernames.is_empty(), class) {
            (false, None) => {
                let outcome = orchestrator.delete_users(&usernames).await;
                report_outcome("User deletion", &outcome)
            }
            (true, Some(tag)) => {
                let result = orchestrator
                    .delete_class_users(&tag, |users| {
                        println!("The following users will be deleted from class {}:", tag);
                        for user in users {
                            println!("{}", user);
                        }
                        prompt("Are you sure you want to delete these users? (yes/no): ")
                            .eq_ignore_ascii_case("yes")
                    })
                    .await;
                match result {
                    Ok(outcome) => report_outcome("User deletion", &outcome),
                    Err(e) => {
                        eprintln!("{}", e);
                        1
                    }
                }
            }
            _ => {
                eprintln!("Usage: tenant-lifecycle delete <username>...");
                eprintln!("   or: tenant-lifecycle delete --class <tag>");
                1
            }
        },
    };
    std::process::exit(code);
}
