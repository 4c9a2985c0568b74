#![allow(dead_code)]

use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt; // for `oneshot`
use uuid::Uuid;

use authz_engine::authz::{permissions, roles};
use authz_engine::config::AppConfig;
use authz_engine::jwt::JwtConfig;
use authz_engine::models::rbac::{
    AssignRoleRequest, Effect, Permission, PermissionCreateRequest, Role, RoleCreateRequest, SubjectKind,
};
use authz_engine::{router, AppState};

pub struct TestApp {
    // keeps the sqlite file alive
    _dir: TempDir,
    pub pool: SqlitePool,
    pub state: AppState,
    pub app: Router,
}

pub async fn setup() -> Result<TestApp> {
    let dir = tempdir()?;
    let db_path = dir.path().join("test.db");

    let opts = SqliteConnectOptions::new()
        .filename(db_path.as_path())
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePool::connect_with(opts).await?;

    let migrator =
        sqlx::migrate::Migrator::new(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")).await?;
    migrator.run(&pool).await?;

    let state = AppState::build(pool.clone(), JwtConfig::new("test-secret", 1), AppConfig::default()).await?;
    let app = router(state.clone());

    Ok(TestApp {
        _dir: dir,
        pool,
        state,
        app,
    })
}

impl TestApp {
    pub fn token(&self, user_id: Uuid) -> Result<String> {
        Ok(self.state.jwt.encode(user_id)?)
    }

    /// Send a request and return the status plus the JSON body (`Null` when empty).
    pub async fn send(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };

        let resp = self.app.clone().oneshot(req).await?;
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .with_context(|| format!("non-JSON body: {}", String::from_utf8_lossy(&bytes)))?
        };
        Ok((status, value))
    }

    pub async fn role(&self, name: &str, parent_id: Option<Uuid>) -> Result<Role> {
        Ok(self
            .state
            .storage
            .create_role(
                RoleCreateRequest {
                    name: name.to_string(),
                    description: None,
                    parent_id,
                },
                false,
            )
            .await?)
    }

    pub async fn permission(&self, resource_type: &str, action: &str, effect: Effect, conditions: Option<Value>) -> Result<Permission> {
        Ok(self
            .state
            .storage
            .create_permission(PermissionCreateRequest {
                name: None,
                resource_type: resource_type.to_string(),
                action: action.to_string(),
                effect,
                conditions,
            })
            .await?)
    }

    pub async fn grant(&self, role: &Role, permission: &Permission) -> Result<()> {
        self.state.storage.assign_permission_to_role(role.id, permission.id).await?;
        Ok(())
    }

    pub async fn assign(&self, kind: SubjectKind, subject_id: Uuid, role: &Role) -> Result<()> {
        self.state
            .storage
            .assign_role(
                kind,
                subject_id,
                AssignRoleRequest {
                    role_id: role.id,
                    resource_id: None,
                    expires_at: None,
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// A user holding the `admin` system role with rbac read/manage and user manage.
    pub async fn admin_user(&self) -> Result<Uuid> {
        let admin = self
            .state
            .storage
            .create_role(
                RoleCreateRequest {
                    name: roles::ADMIN.to_string(),
                    description: None,
                    parent_id: None,
                },
                true,
            )
            .await?;
        for (rt, action) in [
            (permissions::RBAC, permissions::READ),
            (permissions::RBAC, permissions::MANAGE),
            ("user", permissions::MANAGE),
        ] {
            let perm = self.permission(rt, action, Effect::Allow, None).await?;
            self.grant(&admin, &perm).await?;
        }

        let user_id = Uuid::new_v4();
        self.assign(SubjectKind::User, user_id, &admin).await?;
        Ok(user_id)
    }
}
