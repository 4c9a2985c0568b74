use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::authz::{AuthorizationResult, EvaluationTrace};
use crate::events::EventMetricsSnapshot;
use crate::models::rbac;
use crate::routes::{admin, check, health, rbac as rbac_routes};

#[derive(OpenApi)]
#[openapi(
	paths(
		health::health,
		check::check_permission,
		rbac_routes::list_roles,
		rbac_routes::create_role,
		rbac_routes::get_role,
		rbac_routes::update_role,
		rbac_routes::delete_role,
		rbac_routes::list_role_permissions,
		rbac_routes::assign_permission_to_role,
		rbac_routes::revoke_permission_from_role,
		rbac_routes::list_permissions,
		rbac_routes::create_permission,
		rbac_routes::update_permission,
		rbac_routes::delete_permission,
		rbac_routes::list_user_roles,
		rbac_routes::assign_role_to_user,
		rbac_routes::revoke_role_from_user,
		rbac_routes::list_groups,
		rbac_routes::create_group,
		rbac_routes::delete_group,
		rbac_routes::list_group_members,
		rbac_routes::add_group_member,
		rbac_routes::remove_group_member,
		rbac_routes::list_group_roles,
		rbac_routes::assign_role_to_group,
		rbac_routes::revoke_role_from_group,
		admin::invalidate_cache,
		admin::user_matrix,
		admin::event_metrics,
	),
	components(
		schemas(
			health::HealthResponse,
			check::CheckRequest,
			AuthorizationResult,
			EvaluationTrace,
			EventMetricsSnapshot,
			admin::InvalidationScope,
			admin::InvalidateRequest,
			admin::InvalidateResponse,
			rbac::Effect,
			rbac::Role,
			rbac::RoleCreateRequest,
			rbac::RoleUpdateRequest,
			rbac::Permission,
			rbac::PermissionCreateRequest,
			rbac::PermissionUpdateRequest,
			rbac::PermissionDecision,
			rbac::Group,
			rbac::GroupCreateRequest,
			rbac::GroupMember,
			rbac::AddGroupMemberRequest,
			rbac::SubjectKind,
			rbac::RoleAssignment,
			rbac::AssignRoleRequest,
			rbac::RolePermission,
			rbac::AssignPermissionToRoleRequest,
			rbac::UserPermissionMatrix
		)
	),
	modifiers(&BearerAuth),
	tags(
		(name = "Health", description = "Liveness and dependency health"),
		(name = "Authorization", description = "Permission checks"),
		(name = "RBAC", description = "Role, permission and group management"),
		(name = "Admin", description = "Cache and event tooling")
	)
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
	fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
		if let Some(components) = openapi.components.as_mut() {
			components.add_security_scheme(
				"bearerAuth",
				SecurityScheme::Http(
					HttpBuilder::new()
						.scheme(HttpAuthScheme::Bearer)
						.bearer_format("JWT")
						.build(),
				),
			);
		}
	}
}

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(ApiDoc::openapi())?;
	ensure_servers(&mut doc, port);
	Ok(serde_json::from_value(doc)?)
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> anyhow::Result<Router> {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.with_credentials(true)
		.persist_authorization(true);

	let doc_json = Arc::new(serde_json::to_value(&doc)?);

	let json_route = {
		let doc_json = Arc::clone(&doc_json);
		get(move || {
			let doc_json = Arc::clone(&doc_json);
			async move { Json((*doc_json).clone()) }
		})
	};

	Ok(Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config)))
}

fn ensure_servers(doc: &mut Value, port: u16) {
	// https when the server binary will terminate TLS itself
	let tls_enabled = std::env::var("CERT_PATH").is_ok() && std::env::var("KEY_PATH").is_ok();
	let scheme = if tls_enabled { "https" } else { "http" };
	let server_url = format!("{}://localhost:{}", scheme, port);

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr.iter().any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_openapi_lists_management_paths() {
		let doc = serde_json::to_value(build_openapi(8000).unwrap()).unwrap();
		let paths = doc["paths"].as_object().unwrap();
		assert!(paths.contains_key("/authz/check"));
		assert!(paths.contains_key("/rbac/roles/{role_id}"));
		assert!(paths.contains_key("/admin/cache/invalidate"));
		assert_eq!(doc["servers"][0]["url"], "http://localhost:8000");
		assert!(doc["components"]["securitySchemes"].get("bearerAuth").is_some());
	}
}
