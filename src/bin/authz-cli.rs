use sqlx::Row;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use authz_engine::authz::{permissions, roles};
use authz_engine::cache::build_cache;
use authz_engine::config::AppConfig;
use authz_engine::jwt::JwtConfig;
use authz_engine::models::rbac::{AssignRoleRequest, Effect, PermissionCreateRequest, RoleCreateRequest, SubjectKind};
use authz_engine::storage::SqliteStorage;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "authz-engine operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new empty migration with the provided name
    MakeMigration { name: String },
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Create the admin and viewer system roles if they are missing
    SeedSystemRoles,
    /// Assign a role (by name) to a user
    AssignRole {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        role_name: String,
    },
    /// Print a bearer token for a user id
    IssueToken {
        #[arg(long)]
        user: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Try to load env from CWD, then from the crate-local `.env`.
    if dotenv().is_err() {
        let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::MakeMigration { name } => {
            let path = make_migration_file(&name)?;
            println!("Created migration: {}", path.display());
        }
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            migrator.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::SeedSystemRoles => {
            let storage = SqliteStorage::new(get_pool().await?);
            seed_system_roles(&storage).await?;
            println!("System roles seeded");
        }
        Commands::AssignRole { user, role_name } => {
            let storage = SqliteStorage::new(get_pool().await?);
            let role = storage
                .find_role_by_name(&role_name)
                .await?
                .with_context(|| format!("no role named {role_name}"))?;
            storage
                .assign_role(
                    SubjectKind::User,
                    user,
                    AssignRoleRequest {
                        role_id: role.id,
                        resource_id: None,
                        expires_at: None,
                    },
                    None,
                )
                .await?;

            // A running server on a shared cache must not keep the old matrix.
            let config = AppConfig::from_env()?;
            build_cache(&config.cache).await?.invalidate_user(user).await?;
            println!("Assigned {} to {}", role.name, user);
        }
        Commands::IssueToken { user } => {
            let jwt = JwtConfig::from_env()?;
            println!("{}", jwt.encode(user)?);
        }
    }

    Ok(())
}

/// (role, description, [(resource_type, action)])
const SYSTEM_ROLES: [(&str, &str, &[(&str, &str)]); 2] = [
    (
        roles::ADMIN,
        "Full access to the management API",
        &[
            (permissions::RBAC, permissions::READ),
            (permissions::RBAC, permissions::MANAGE),
            ("user", permissions::MANAGE),
        ],
    ),
    (
        roles::VIEWER,
        "Read-only access to the management API",
        &[(permissions::RBAC, permissions::READ)],
    ),
];

async fn seed_system_roles(storage: &SqliteStorage) -> anyhow::Result<()> {
    let existing = storage.list_permissions().await?;

    for (name, description, grants) in SYSTEM_ROLES {
        let role = match storage.find_role_by_name(name).await? {
            Some(role) => role,
            None => {
                storage
                    .create_role(
                        RoleCreateRequest {
                            name: name.to_string(),
                            description: Some(description.to_string()),
                            parent_id: None,
                        },
                        true,
                    )
                    .await?
            }
        };

        for (resource_type, action) in grants.iter().copied() {
            let permission_name = format!("{resource_type}.{action}");
            let permission = match existing.iter().find(|p| p.name == permission_name) {
                Some(permission) => permission.clone(),
                None => {
                    storage
                        .create_permission(PermissionCreateRequest {
                            name: Some(permission_name.clone()),
                            resource_type: resource_type.to_string(),
                            action: action.to_string(),
                            effect: Effect::Allow,
                            conditions: None,
                        })
                        .await?
                }
            };
            storage.assign_permission_to_role(role.id, permission.id).await?;
        }
        println!("{:<8} {}", name, role.id);
    }

    Ok(())
}

fn make_migration_file(name: &str) -> anyhow::Result<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let sanitized = sanitize_name(name);
    let filename = format!("{}_{}.sql", timestamp, sanitized);
    let path = Path::new("migrations").join(filename);

    if path.exists() {
        anyhow::bail!("migration already exists: {}", path.display());
    }

    fs::write(&path, "-- Write your migration SQL here\n")
        .with_context(|| format!("failed to create migration at {}", path.display()))?;

    Ok(path)
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to database")
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    // If the migrations table doesn't exist, nothing is applied yet
    let db_applied = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'")
        .fetch_optional(pool)
        .await?;
    let applied_versions: HashSet<i64> = if db_applied.is_some() {
        let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?;
        rows.iter().filter_map(|row| row.try_get::<i64, _>("version").ok()).collect()
    } else {
        HashSet::new()
    };

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter() {
        let version = migration.version;
        let status = if applied_versions.contains(&version) { "applied" } else { "pending" };
        let desc = migration.description.as_ref().trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, version, name);
    }

    Ok(())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    // ./migrations when run from the repo root, else the crate-local folder
    let local = Path::new("./migrations");
    let migrator_path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let migrator_path_display = migrator_path.display().to_string();
    sqlx::migrate::Migrator::new(migrator_path)
        .await
        .with_context(|| format!("failed to load migrations from {}", migrator_path_display))
}
