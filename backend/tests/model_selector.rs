mod common;

use common::{add_default_model, add_model, default_count, harness, FakeProvider};
use lmchat_lib::db::models::ModelUpdate;
use lmchat_lib::error::AppError;

#[tokio::test]
async fn resolve_default_with_no_models_is_a_business_error() {
    let h = harness(FakeProvider::new()).await;

    let err = h.state.models.resolve_default().await.expect_err("no models");
    match err {
        AppError::BusinessRule { code, message } => {
            assert_eq!(code, "NO_AI_MODEL");
            assert_eq!(message.to_lowercase(), "no active model available");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn resolve_default_falls_back_to_earliest_active() {
    let h = harness(FakeProvider::new()).await;
    add_model(&h.state, "dormant", false).await;
    let first = add_model(&h.state, "first", true).await;
    add_model(&h.state, "second", true).await;

    let resolved = h.state.models.resolve_default().await.expect("resolved");
    assert_eq!(resolved.id, first.id);
}

#[tokio::test]
async fn set_default_then_resolve_returns_it() {
    let h = harness(FakeProvider::new()).await;
    let a = add_default_model(&h.state, "a").await;
    let b = add_model(&h.state, "b", true).await;
    assert_eq!(h.state.models.resolve_default().await.expect("a").id, a.id);

    h.state.models.set_default(&b.id).await.expect("switch default");
    assert_eq!(h.state.models.resolve_default().await.expect("b").id, b.id);
    assert_eq!(default_count(&h.state).await, 1);

    h.state.models.set_default(&a.id).await.expect("switch back");
    assert_eq!(h.state.models.resolve_default().await.expect("a").id, a.id);
    assert_eq!(default_count(&h.state).await, 1);
}

#[tokio::test]
async fn set_default_activates_an_inactive_model() {
    let h = harness(FakeProvider::new()).await;
    let dormant = add_model(&h.state, "dormant", false).await;

    let updated = h.state.models.set_default(&dormant.id).await.expect("default");
    assert_eq!(updated.is_default, 1);
    assert_eq!(updated.is_active, 1);
}

#[tokio::test]
async fn set_default_on_unknown_model_keeps_current_default() {
    let h = harness(FakeProvider::new()).await;
    let a = add_default_model(&h.state, "a").await;

    let err = h.state.models.set_default("missing").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound { .. }));
    assert_eq!(h.state.models.resolve_default().await.expect("a").id, a.id);
    assert_eq!(default_count(&h.state).await, 1);
}

#[tokio::test]
async fn concurrent_default_switches_leave_one_default() {
    let h = harness(FakeProvider::new()).await;
    let mut ids = Vec::new();
    for name in ["m1", "m2", "m3", "m4"] {
        ids.push(add_model(&h.state, name, true).await.id);
    }

    let mut tasks = Vec::new();
    for id in ids.iter().cloned().cycle().take(12) {
        let models = h.state.models.clone();
        tasks.push(tokio::spawn(async move { models.set_default(&id).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("set default");
    }

    assert_eq!(default_count(&h.state).await, 1);
}

#[tokio::test]
async fn storage_rejects_a_second_default() {
    let h = harness(FakeProvider::new()).await;
    add_default_model(&h.state, "a").await;
    let b = add_model(&h.state, "b", true).await;

    let result = sqlx::query("UPDATE ai_models SET is_default = 1 WHERE id = ?1")
        .bind(&b.id)
        .execute(h.state.db.write_pool())
        .await;
    assert!(result.is_err());
    assert_eq!(default_count(&h.state).await, 1);
}

#[tokio::test]
async fn default_model_cannot_be_deleted_or_deactivated() {
    let h = harness(FakeProvider::new()).await;
    let a = add_default_model(&h.state, "a").await;

    let err = h.state.models.delete(&a.id).await.expect_err("locked");
    assert_eq!(err.code(), "DEFAULT_MODEL_LOCKED");

    let err = h.state.models.toggle_active(&a.id).await.expect_err("locked");
    assert_eq!(err.code(), "DEFAULT_MODEL_LOCKED");

    let unchanged = h.state.models.get_model(&a.id).await.expect("still there");
    assert_eq!(unchanged.is_default, 1);
    assert_eq!(unchanged.is_active, 1);
}

#[tokio::test]
async fn non_default_models_toggle_and_delete() {
    let h = harness(FakeProvider::new()).await;
    add_default_model(&h.state, "a").await;
    let b = add_model(&h.state, "b", true).await;

    let toggled = h.state.models.toggle_active(&b.id).await.expect("toggle off");
    assert_eq!(toggled.is_active, 0);
    let toggled = h.state.models.toggle_active(&b.id).await.expect("toggle on");
    assert_eq!(toggled.is_active, 1);

    h.state.models.delete(&b.id).await.expect("delete");
    let err = h.state.models.get_model(&b.id).await.expect_err("gone");
    assert!(matches!(err, AppError::NotFound { .. }));

    let err = h.state.models.delete("missing").await.expect_err("missing");
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn sync_inserts_new_provider_model_as_active_default() {
    let h = harness(FakeProvider::new().with_models(&["llama-3"])).await;

    let inserted = h.state.models.sync_from_provider().await.expect("sync");
    assert_eq!(inserted, 1);

    let model = h
        .state
        .model_repo
        .get_by_model_id("llama-3")
        .await
        .expect("query")
        .expect("inserted");
    assert_eq!(model.is_active, 1);
    assert_eq!(model.is_default, 1);
    assert_eq!(model.provider, "LMStudio");
    assert_eq!(model.endpoint, "http://fake.local/v1");
    assert_eq!(model.max_tokens, 4096);
    assert!((model.temperature - 0.7).abs() < f64::EPSILON);

    assert_eq!(h.state.models.sync_from_provider().await.expect("resync"), 0);
}

#[tokio::test]
async fn sync_promotes_only_the_first_new_model() {
    let h = harness(FakeProvider::new().with_models(&["alpha", "beta", "gamma"])).await;

    assert_eq!(h.state.models.sync_from_provider().await.expect("sync"), 3);
    assert_eq!(default_count(&h.state).await, 1);
    assert_eq!(
        h.state.models.resolve_default().await.expect("default").model_id,
        "alpha"
    );
}

#[tokio::test]
async fn sync_keeps_existing_default() {
    let h = harness(FakeProvider::new().with_models(&["local", "remote-new"])).await;
    let local = add_default_model(&h.state, "local").await;

    assert_eq!(h.state.models.sync_from_provider().await.expect("sync"), 1);

    let added = h
        .state
        .model_repo
        .get_by_model_id("remote-new")
        .await
        .expect("query")
        .expect("inserted");
    assert_eq!(added.is_default, 0);
    assert_eq!(added.is_active, 1);
    assert_eq!(h.state.models.resolve_default().await.expect("default").id, local.id);
}

#[tokio::test]
async fn sync_with_unreachable_provider_changes_nothing() {
    let h = harness(FakeProvider::new()).await;
    assert_eq!(h.state.models.sync_from_provider().await.expect("sync"), 0);
    assert!(h.state.model_repo.list_all().await.expect("list").is_empty());
}

#[tokio::test]
async fn override_resolves_by_row_or_provider_id() {
    let h = harness(FakeProvider::new()).await;
    add_default_model(&h.state, "a").await;
    let b = add_model(&h.state, "b", true).await;
    let c = add_model(&h.state, "c", false).await;

    let by_row = h.state.models.resolve_for_request(Some(b.id.as_str())).await.expect("row id");
    assert_eq!(by_row.id, b.id);
    let by_provider = h.state.models.resolve_for_request(Some("b")).await.expect("model id");
    assert_eq!(by_provider.id, b.id);

    let err = h
        .state
        .models
        .resolve_for_request(Some(c.id.as_str()))
        .await
        .expect_err("inactive");
    assert!(matches!(err, AppError::NotFound { .. }));

    let fallback = h.state.models.resolve_for_request(None).await.expect("default");
    assert_eq!(fallback.model_id, "a");
}

#[tokio::test]
async fn update_validates_temperature() {
    let h = harness(FakeProvider::new()).await;
    let a = add_default_model(&h.state, "a").await;

    let err = h
        .state
        .models
        .update_model(
            &a.id,
            ModelUpdate {
                temperature: Some(2.5),
                ..ModelUpdate::default()
            },
        )
        .await
        .expect_err("too hot");
    assert!(matches!(err, AppError::Validation { .. }));

    let updated = h
        .state
        .models
        .update_model(
            &a.id,
            ModelUpdate {
                name: Some("Llama 3 Instruct".to_string()),
                temperature: Some(1.2),
                max_tokens: Some(8192),
                ..ModelUpdate::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.name, "Llama 3 Instruct");
    assert_eq!(updated.max_tokens, 8192);
    assert!((updated.temperature - 1.2).abs() < f64::EPSILON);
    assert_eq!(updated.model_id, "a");
}

#[tokio::test]
async fn list_available_marks_loaded_models() {
    let h = harness(FakeProvider::new().with_loaded(&["b"])).await;
    add_default_model(&h.state, "a").await;
    add_model(&h.state, "b", true).await;

    let summaries = h.state.models.list_available().await.expect("list");
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert_eq!(summary.is_loaded, summary.model.model_id == "b");
        assert!(summary.is_local_model);
        assert_eq!(summary.display_name, format!("{} (LMStudio)", summary.model.name));
    }

    let json = serde_json::to_value(&summaries[0]).expect("serialize");
    assert!(json.get("apiKey").is_none());
    assert!(json.get("modelId").is_some());
}

#[tokio::test]
async fn failed_on_demand_sync_falls_through_to_resolution() {
    let h = harness(FakeProvider::new().with_models(&["llama-3"])).await;
    // A row the catalogue cannot decode makes the sync fail before inserting.
    sqlx::query(
        "INSERT INTO ai_models (id, name, model_id, endpoint, max_tokens, is_active)
         VALUES ('broken', 'broken', 'broken', 'http://fake.local/v1', 'many', 0)",
    )
    .execute(h.state.db.write_pool())
    .await
    .expect("seed undecodable row");

    let err = h.state.models.sync_from_provider().await.expect_err("sync fails");
    assert!(matches!(err, AppError::Database(_)));
    assert!(err.to_string().contains("reading local model catalogue"));

    let err = h
        .state
        .models
        .resolve_for_request(None)
        .await
        .expect_err("nothing active");
    assert_eq!(err.code(), "NO_AI_MODEL");
}
