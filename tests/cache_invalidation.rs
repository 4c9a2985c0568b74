mod common;

use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use authz_engine::authz::PermissionResolver;
use authz_engine::cache::PermissionCache;
use authz_engine::models::rbac::{Effect, SubjectKind};

#[tokio::test]
async fn cache_round_trip_and_user_invalidation() -> Result<()> {
    let t = common::setup().await?;
    let user = Uuid::new_v4();
    let role = t.role("viewer", None).await?;
    let read = t.permission("doc", "read", Effect::Allow, None).await?;
    t.grant(&role, &read).await?;
    t.assign(SubjectKind::User, user, &role).await?;

    let computed = t.state.authz.get_user_matrix(user).await?;
    let cache = t.state.authz.cache();
    let cached = cache.get(user).await?.expect("matrix cached after first load");
    assert_eq!(cached, computed);

    t.state.authz.invalidate_user(user).await?;
    assert!(cache.get(user).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn role_invalidation_cascades_to_every_holder() -> Result<()> {
    let t = common::setup().await?;
    let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let role = t.role("editor", None).await?;
    let other = t.role("guest", None).await?;
    t.assign(SubjectKind::User, a, &role).await?;
    t.assign(SubjectKind::User, b, &role).await?;
    t.assign(SubjectKind::User, outsider, &other).await?;

    for user in [a, b, outsider] {
        t.state.authz.get_user_matrix(user).await?;
    }

    let dropped = t.state.authz.invalidate_role(role.id).await?;
    assert_eq!(dropped, 2);

    let cache = t.state.authz.cache();
    assert!(cache.get(a).await?.is_none());
    assert!(cache.get(b).await?.is_none());
    assert!(cache.get(outsider).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn granting_a_permission_through_the_api_is_visible_on_the_next_check() -> Result<()> {
    let t = common::setup().await?;
    let admin = t.admin_user().await?;
    let admin_token = t.token(admin)?;
    let user = Uuid::new_v4();

    let role = t.role("writer", None).await?;
    let write = t.permission("doc", "write", Effect::Allow, None).await?;
    t.assign(SubjectKind::User, user, &role).await?;

    let before = t.state.authz.check_permission(user, "doc", "doc-1", "write", None).await?;
    assert!(!before.allowed);

    let (status, body) = t
        .send(
            "POST",
            &format!("/rbac/roles/{}/permissions", role.id),
            Some(&admin_token),
            Some(json!({ "permission_id": write.id })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    let after = t.state.authz.check_permission(user, "doc", "doc-1", "write", None).await?;
    assert!(after.allowed);
    assert!(!after.trace.cache_hit, "role.permission_assigned must invalidate holders");
    Ok(())
}

#[tokio::test]
async fn group_membership_changes_invalidate_the_member() -> Result<()> {
    let t = common::setup().await?;
    let admin = t.admin_user().await?;
    let admin_token = t.token(admin)?;
    let user = Uuid::new_v4();

    let role = t.role("reader", None).await?;
    let read = t.permission("doc", "read", Effect::Allow, None).await?;
    t.grant(&role, &read).await?;

    let (status, group) = t
        .send("POST", "/rbac/groups", Some(&admin_token), Some(json!({ "name": "readers" })))
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    let group_id = group["id"].as_str().unwrap().to_string();

    let (status, _) = t
        .send(
            "POST",
            &format!("/rbac/groups/{}/roles", group_id),
            Some(&admin_token),
            Some(json!({ "role_id": role.id })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);

    assert!(!t.state.authz.check_permission(user, "doc", "d", "read", None).await?.allowed);

    let (status, _) = t
        .send(
            "POST",
            &format!("/rbac/groups/{}/members", group_id),
            Some(&admin_token),
            Some(json!({ "user_id": user })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert!(t.state.authz.check_permission(user, "doc", "d", "read", None).await?.allowed);

    let (status, _) = t
        .send(
            "DELETE",
            &format!("/rbac/groups/{}/members/{}", group_id, user),
            Some(&admin_token),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!t.state.authz.check_permission(user, "doc", "d", "read", None).await?.allowed);
    Ok(())
}

#[tokio::test]
async fn resolution_is_idempotent_over_sqlite() -> Result<()> {
    let t = common::setup().await?;
    let user = Uuid::new_v4();
    let base = t.role("base", None).await?;
    let child = t.role("child", Some(base.id)).await?;
    let read = t.permission("doc", "read", Effect::Allow, None).await?;
    let no_write = t.permission("doc", "write", Effect::Deny, None).await?;
    t.grant(&base, &read).await?;
    t.grant(&child, &no_write).await?;
    t.assign(SubjectKind::User, user, &child).await?;
    t.assign(SubjectKind::User, user, &base).await?;

    let resolver = PermissionResolver::new(t.state.storage.clone());
    let first = resolver.compute_user_permission_matrix(user).await?;
    let second = resolver.compute_user_permission_matrix(user).await?;

    assert_eq!(first.final_permissions, second.final_permissions);
    assert_eq!(first.direct_roles, second.direct_roles);
    let mut sorted = first.direct_roles.clone();
    sorted.sort();
    assert_eq!(first.direct_roles, sorted);
    assert_eq!(first.final_permissions.len(), 2);

    // cached entries expire on their own
    let cache = t.state.authz.cache();
    cache.set(user, &first, Duration::from_millis(20)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.get(user).await?.is_none());
    Ok(())
}
