//! End-to-end gateway behavior over a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use switchboard_gateway::registry::{FallbackPolicy, ResetPolicy, ResponseShape, TierLimit};
use switchboard_gateway::{
    ApiKey, AuthScheme, Availability, ConversationState, CredentialStore, Error, Gateway,
    GatewaySettings, MockTransport, ModelTarget, ProviderConfig, ProviderRegistry, ProviderStatus,
    QuotaDecision, QuotaTracker, Tier,
};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn gateway(mock: &Arc<MockTransport>) -> Gateway {
    Gateway::new(
        Arc::new(ProviderRegistry::new()),
        Arc::new(CredentialStore::in_memory()),
        mock.clone(),
        GatewaySettings::default(),
    )
}

fn provider(id: &str) -> ProviderConfig {
    ProviderConfig::new(
        id,
        format!("https://{id}.test"),
        AuthScheme::BearerHeader,
        "Authorization",
    )
}

fn models_url(id: &str) -> String {
    format!("https://{id}.test/models")
}

fn chat_url(id: &str) -> String {
    format!("https://{id}.test/chat/completions")
}

fn model_list(ids: &[&str]) -> Value {
    let data: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
    json!({ "data": data })
}

fn chat_reply(content: &str) -> Value {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 2, "completion_tokens": 3 }
    })
}

/// Register `config` with a secret and refresh its catalog.
async fn register(gateway: &Gateway, config: ProviderConfig, secret: &str) {
    let id = config.id.clone();
    let health = assert_ok!(gateway.add_provider(config, Some(ApiKey::new(secret))).await);
    assert_eq!(health.status, ProviderStatus::Healthy, "{id} should verify");
    assert!(gateway.refresh_models(&id).await.unwrap().warning.is_none());
}

// ==================== Auth Artifact Tests ====================

#[tokio::test]
async fn every_request_carries_exactly_one_auth_artifact() {
    let secret = "sk-artifact-7731";
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);

    let configs = [
        ProviderConfig::new("bearer", "https://bearer.test", AuthScheme::BearerHeader, "Authorization"),
        ProviderConfig::new("named", "https://named.test", AuthScheme::NamedHeader, "x-api-key"),
        ProviderConfig::new("query", "https://query.test/v1", AuthScheme::QueryParam, "key"),
    ];
    for config in configs {
        let id = config.id.clone();
        let base = config.base_url.clone();
        mock.respond_json(&format!("{base}/models"), 200, model_list(&["m"]));
        mock.respond_json(&format!("{base}/chat/completions"), 200, chat_reply("ok"));
        register(&gateway, config, secret).await;

        let conv = gateway
            .start_conversation(Some(ModelTarget::new(&id, "m")))
            .await
            .unwrap();
        assert_ok!(gateway.send_message(&conv.id, None, "hi").await);
    }

    let requests = mock.requests();
    assert!(requests.len() >= 9);
    for request in &requests {
        let in_headers = request
            .headers
            .iter()
            .filter(|(_, v)| v.contains(secret))
            .count();
        let in_query = request
            .url
            .query_pairs()
            .filter(|(_, v)| v.contains(secret))
            .count();
        assert_eq!(in_headers + in_query, 1, "{request:?}");

        match request.url.host_str() {
            Some("bearer.test") => {
                assert_eq!(request.header("Authorization"), Some("Bearer sk-artifact-7731"))
            }
            Some("named.test") => assert_eq!(request.header("x-api-key"), Some(secret)),
            Some("query.test") => {
                assert_eq!(request.query_param("key").as_deref(), Some(secret));
                assert_eq!(request.headers.len(), 0);
            }
            other => panic!("unexpected host {other:?}"),
        }
    }
}

// ==================== Binding Tests ====================

#[tokio::test]
async fn bound_conversation_rejects_another_model() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 200, model_list(&["large", "small"]));
    mock.respond_json(&chat_url("acme"), 200, chat_reply("hello"));
    mock.respond_json(&models_url("other"), 200, model_list(&["large"]));
    register(&gateway, provider("acme"), "sk-a").await;
    register(&gateway, provider("other"), "sk-o").await;

    let conv = gateway.start_conversation(None).await.unwrap();
    assert_ok!(
        gateway
            .send_message(&conv.id, Some(ModelTarget::new("acme", "large")), "hi")
            .await
    );
    let before = gateway.get_conversation(&conv.id).await.unwrap();

    for target in [ModelTarget::new("acme", "small"), ModelTarget::new("other", "large")] {
        let err = assert_err!(gateway.send_message(&conv.id, Some(target), "switch").await);
        assert!(matches!(err, Error::ConversationBindingViolation { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    assert_eq!(gateway.get_conversation(&conv.id).await.unwrap(), before);
    assert_eq!(mock.request_count(&chat_url("acme")), 1);
    assert_eq!(mock.request_count(&chat_url("other")), 0);
}

// ==================== Catalog Tests ====================

#[tokio::test]
async fn unchanged_remote_yields_identical_catalogs() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(
        &models_url("acme"),
        200,
        json!({ "data": [{ "id": "zeta" }, { "id": "alpha", "capabilities": ["chat", "vision"] }, { "id": "mid" }] }),
    );
    register(&gateway, provider("acme"), "sk").await;
    let first = serde_json::to_vec(&gateway.list_models(Some("acme")).unwrap()).unwrap();

    gateway.refresh_models("acme").await.unwrap();
    let second = serde_json::to_vec(&gateway.list_models(Some("acme")).unwrap()).unwrap();

    assert_eq!(first, second);
    let ids: Vec<_> = gateway
        .list_models(Some("acme"))
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn object_shape_provider_lists_and_chats() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(
        "http://local.test:11434/api/tags",
        200,
        json!({ "models": [{ "name": "llama3:8b", "details": { "families": ["llama"] } }] }),
    );
    mock.respond_json(
        "http://local.test:11434/api/chat",
        200,
        json!({ "message": { "role": "assistant", "content": "pong" }, "prompt_eval_count": 4, "eval_count": 1 }),
    );
    let config = ProviderConfig::new("local", "http://local.test:11434", AuthScheme::NamedHeader, "x-token")
        .response_shape(ResponseShape::SingleCompletionObject);
    register(&gateway, config, "tok").await;

    let models = gateway.list_models(Some("local")).unwrap();
    assert_eq!(models.len(), 1);
    assert!(models[0].has_tags(["chat", "llama"]));

    let conv = gateway
        .start_conversation(Some(ModelTarget::new("local", "llama3:8b")))
        .await
        .unwrap();
    let reply = gateway.send_message(&conv.id, None, "ping").await.unwrap();
    assert_eq!(reply.content, "pong");
    assert_eq!(reply.usage.unwrap().total(), 5);
}

// Scenario: three providers, the second hangs past the catalog timeout.
#[tokio::test(start_paused = true)]
async fn refresh_all_isolates_a_hanging_provider() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("one"), 200, model_list(&["a"]));
    mock.respond_json(&models_url("three"), 200, model_list(&["c"]));
    // verify, first refresh, then never again
    mock.respond_json(&models_url("two"), 200, model_list(&["b1", "b2"]))
        .respond_json(&models_url("two"), 200, model_list(&["b1", "b2"]))
        .hang(&models_url("two"));
    for id in ["one", "two", "three"] {
        register(&gateway, provider(id), "sk").await;
    }

    let started = Instant::now();
    let outcomes = gateway.refresh_all().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        match outcome.provider_id.as_str() {
            "two" => {
                let warning = outcome.warning.as_ref().unwrap();
                assert_eq!(warning.stale, 2);
            }
            _ => assert!(outcome.warning.is_none()),
        }
    }

    let two = gateway.list_models(Some("two")).unwrap();
    assert_eq!(two.len(), 2);
    assert!(two.iter().all(|m| m.availability == Availability::Stale));
    let one = gateway.list_models(Some("one")).unwrap();
    assert_eq!(one[0].availability, Availability::Listed);
}

#[tokio::test]
async fn unreachable_provider_without_history_is_unavailable() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 503, json!({ "error": "down" }));

    let health = gateway
        .add_provider(provider("acme"), Some(ApiKey::new("sk")))
        .await
        .unwrap();
    assert_eq!(health.status, ProviderStatus::Unreachable);

    let outcome = gateway.refresh_models("acme").await.unwrap();
    assert!(outcome.warning.is_some());
    assert!(outcome.models.is_empty());
    let catalog = gateway.catalog().catalog("acme").unwrap();
    assert_eq!(catalog.availability, Availability::Unavailable);
}

// ==================== Health Tests ====================

#[tokio::test]
async fn named_header_provider_verifies_healthy() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json("https://vendor.test/v1/models", 200, model_list(&["m"]));
    let config = ProviderConfig::new("vendor", "https://vendor.test/v1", AuthScheme::NamedHeader, "x-api-key");

    let health = gateway
        .add_provider(config, Some(ApiKey::new("vendor-secret")))
        .await
        .unwrap();

    assert_eq!(health.status, ProviderStatus::Healthy);
    assert_eq!(
        gateway.get_provider("vendor").unwrap().status,
        ProviderStatus::Healthy
    );
    let request = &mock.requests()[0];
    assert_eq!(request.header("x-api-key"), Some("vendor-secret"));
    assert_eq!(request.header("Authorization"), None);
}

#[tokio::test]
async fn rejected_key_reports_unauthorized_and_never_leaks() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 401, json!({ "error": "bad key" }));

    let health = gateway
        .add_provider(provider("acme"), Some(ApiKey::new("sk-leak-check")))
        .await
        .unwrap();

    assert_eq!(health.status, ProviderStatus::Unauthorized);
    assert!(!health.detail.unwrap_or_default().contains("sk-leak-check"));
}

// ==================== Quota Tests ====================

#[test]
fn quota_count_never_exceeds_limit() {
    for fallback in [None, Some("mini")] {
        let tracker = QuotaTracker::new();
        let mut limit = TierLimit::new(Tier::Free, 5, ResetPolicy::Rolling24h);
        if let Some(model) = fallback {
            limit = limit.with_fallback(model);
        }
        tracker.configure(&provider("acme").tier_limit(limit));

        for i in 0..20 {
            let decision = tracker.check("acme", Tier::Free, "main");
            let counter = tracker.usage("acme").remove(0);
            assert!(counter.count <= 5);
            match (i < 5, fallback, decision) {
                (true, _, QuotaDecision::Allowed { model_id, substituted_from }) => {
                    assert_eq!(model_id, "main");
                    assert!(substituted_from.is_none());
                }
                (false, Some(mini), QuotaDecision::Allowed { model_id, substituted_from }) => {
                    assert_eq!(model_id, mini);
                    assert_eq!(substituted_from.as_deref(), Some("main"));
                }
                (false, None, QuotaDecision::Denied(e)) => {
                    assert!(matches!(e, Error::QuotaExceeded { .. }))
                }
                (_, _, other) => panic!("check {i} with fallback {fallback:?}: {other:?}"),
            }
        }
    }
}

async fn limited_gateway(
    mock: &Arc<MockTransport>,
    limit: TierLimit,
) -> (Gateway, String) {
    let gateway = gateway(mock);
    mock.respond_json(&models_url("acme"), 200, model_list(&["large", "model-mini"]));
    mock.respond_json(&chat_url("acme"), 200, chat_reply("ok"));
    register(&gateway, provider("acme").tier_limit(limit), "sk").await;
    let conv = gateway
        .start_conversation(Some(ModelTarget::new("acme", "large")))
        .await
        .unwrap();
    for _ in 0..50 {
        assert_ok!(gateway.send_message(&conv.id, None, "again").await);
    }
    (gateway, conv.id)
}

#[tokio::test]
async fn limit_without_fallback_denies_the_51st_request() {
    let mock = Arc::new(MockTransport::new());
    let (gateway, conv_id) =
        limited_gateway(&mock, TierLimit::new(Tier::Paid, 50, ResetPolicy::CalendarDay)).await;

    let err = assert_err!(gateway.send_message(&conv_id, None, "one more").await);

    assert!(matches!(err, Error::QuotaExceeded { tier: Some(Tier::Paid), .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(mock.request_count(&chat_url("acme")), 50);
    assert_eq!(gateway.get_conversation(&conv_id).await.unwrap().messages.len(), 100);
}

#[tokio::test]
async fn limit_with_fallback_substitutes_and_records() {
    let mock = Arc::new(MockTransport::new());
    let (gateway, conv_id) = limited_gateway(
        &mock,
        TierLimit::new(Tier::Paid, 50, ResetPolicy::CalendarDay).with_fallback("model-mini"),
    )
    .await;

    let reply = gateway.send_message(&conv_id, None, "one more").await.unwrap();

    assert_eq!(reply.model.as_deref(), Some("model-mini"));
    assert_eq!(reply.substituted_from.as_deref(), Some("large"));
    let last = mock.requests().pop().unwrap();
    assert_eq!(last.body.unwrap()["model"], "model-mini");

    let conv = gateway.get_conversation(&conv_id).await.unwrap();
    assert_eq!(conv.bound_model_id(), Some("large"));
    assert_eq!(gateway.usage("acme").unwrap()[0].count, 50);
}

#[tokio::test]
async fn disabled_fallback_policy_denies_even_with_fallback() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 200, model_list(&["large"]));
    mock.respond_json(&chat_url("acme"), 200, chat_reply("ok"));
    let config = provider("acme")
        .fallback_policy(FallbackPolicy::Disabled)
        .tier_limit(TierLimit::new(Tier::Paid, 1, ResetPolicy::None).with_fallback("mini"));
    register(&gateway, config, "sk").await;
    let conv = gateway
        .start_conversation(Some(ModelTarget::new("acme", "large")))
        .await
        .unwrap();
    assert_ok!(gateway.send_message(&conv.id, None, "one").await);

    let err = assert_err!(gateway.send_message(&conv.id, None, "two").await);
    assert!(matches!(err, Error::QuotaExceeded { .. }));
}

#[tokio::test]
async fn remote_rate_limit_is_surfaced_with_retry_after() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 200, model_list(&["large"]));
    mock.respond(
        &chat_url("acme"),
        switchboard_gateway::adapter::WireResponse::new(429, "slow down").with_header("Retry-After", "30"),
    );
    register(&gateway, provider("acme"), "sk").await;
    let conv = gateway
        .start_conversation(Some(ModelTarget::new("acme", "large")))
        .await
        .unwrap();

    let err = assert_err!(gateway.send_message(&conv.id, None, "hi").await);

    assert!(matches!(
        err,
        Error::QuotaExceeded { retry_after_secs: Some(30), .. }
    ));
    let conv = gateway.get_conversation(&conv.id).await.unwrap();
    assert_eq!(conv.messages.len(), 2);
    assert_eq!(conv.state, ConversationState::Bound);
}

// ==================== Removal Cascade Tests ====================

#[tokio::test]
async fn removing_provider_cascades_everywhere() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 200, model_list(&["large", "small"]));
    mock.respond_json(&chat_url("acme"), 200, chat_reply("ok"));
    mock.respond_json(&models_url("keep"), 200, model_list(&["m"]));
    register(&gateway, provider("acme"), "sk-a").await;
    register(&gateway, provider("keep"), "sk-k").await;

    gateway.add_favorite("acme", "large").await.unwrap();
    gateway.add_favorite("keep", "m").await.unwrap();
    gateway.add_favorite("acme", "small").await.unwrap();
    let conv = gateway
        .start_conversation(Some(ModelTarget::new("acme", "large")))
        .await
        .unwrap();
    gateway.send_message(&conv.id, None, "hi").await.unwrap();

    gateway.remove_provider("acme").await.unwrap();

    let favorites = gateway.list_favorites();
    assert_eq!(favorites.len(), 1);
    assert_eq!((favorites[0].model_id.as_str(), favorites[0].rank), ("m", 1));
    let conv = gateway.get_conversation(&conv.id).await.unwrap();
    assert_eq!(conv.state, ConversationState::Closed);
    assert!(!gateway.credentials().has("acme").await);
    assert!(gateway.credentials().has("keep").await);
    assert!(gateway.list_models(None).unwrap().iter().all(|m| m.provider_id == "keep"));
    assert!(matches!(
        gateway.get_provider("acme"),
        Err(Error::ProviderNotFound(_))
    ));
}

#[tokio::test]
async fn favorite_then_remove_provider_leaves_no_favorites() {
    let mock = Arc::new(MockTransport::new());
    let gateway = gateway(&mock);
    mock.respond_json(&models_url("acme"), 200, model_list(&["large"]));
    register(&gateway, provider("acme"), "sk").await;
    gateway.add_favorite("acme", "large").await.unwrap();

    gateway.remove_provider("acme").await.unwrap();

    assert!(gateway.list_favorites().is_empty());
}
