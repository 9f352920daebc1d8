//! Composes the Control API's warp filters: route CRUD, the streaming
//! viewer (plain/JSON/websocket), and the health check, all wired to
//! one shared [`Registry`] via `warp::any().map(move || ...)`, the
//! teacher's pattern for injecting shared state into a filter chain
//! (see `lib/api/src/server.rs`'s `qm_state`).

use std::convert::Infallible;
use std::sync::Arc;

use stevedore_core::Registry;
use warp::filters::BoxedFilter;
use warp::{Filter, Reply};

use crate::handlers;

fn with_registry(
    registry: Arc<Registry>,
) -> impl Filter<Extract = (Arc<Registry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

pub fn make_routes(registry: Arc<Registry>) -> BoxedFilter<(impl Reply,)> {
    let health = warp::path("health")
        .and(warp::get())
        .and_then(handlers::health);

    let list = warp::path("routes")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .and_then(handlers::list_routes);

    let add = warp::path("routes")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(1024 * 64))
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(handlers::add_route);

    let get_one = warp::path!("routes" / String)
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .and_then(handlers::get_route);

    let delete_one = warp::path!("routes" / String)
        .and(warp::delete())
        .and(with_registry(registry.clone()))
        .and_then(handlers::delete_route);

    let logs_ws = warp::path("logs")
        .and(warp::path::tail())
        .and(warp::query())
        .and(warp::ws())
        .and(with_registry(registry.clone()))
        .and_then(handlers::logs_ws);

    let logs_plain = warp::path("logs")
        .and(warp::path::tail())
        .and(warp::query())
        .and(warp::get())
        .and(warp::header::optional::<String>("accept"))
        .and(with_registry(registry))
        .and_then(handlers::logs_plain);

    health
        .or(list)
        .or(add)
        .or(get_one)
        .or(delete_one)
        .or(logs_ws)
        .or(logs_plain)
        .recover(handlers::recover)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    use stevedore_core::runtime::mock::MockRuntime;
    use stevedore_core::{Adapter, AdapterFactories, PumpSupervisor, Sink, SupervisorConfig};

    struct NullAdapter;
    #[async_trait::async_trait]
    impl Adapter for NullAdapter {
        async fn stream(self: Box<Self>, _sink: Sink) {}
    }

    fn test_registry() -> Arc<Registry> {
        let factories = AdapterFactories::new();
        factories.register("test", Box::new(|_descriptor| Ok(Box::new(NullAdapter) as Box<dyn Adapter>)));
        let supervisor = PumpSupervisor::new(Arc::new(MockRuntime::new()), SupervisorConfig::default());
        Arc::new(Registry::new(Arc::new(factories), supervisor, None))
    }

    #[tokio::test]
    async fn health_returns_200() {
        let filter = make_routes(test_registry());
        let resp = warp::test::request().path("/health").reply(&filter).await;
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn post_then_get_and_list_round_trip() {
        let registry = test_registry();
        let filter = make_routes(registry);

        let created = warp::test::request()
            .method("POST")
            .path("/routes")
            .json(&serde_json::json!({"adapter": "test", "address": "test://a"}))
            .reply(&filter)
            .await;
        assert_eq!(created.status(), 201);
        let body: serde_json::Value = serde_json::from_slice(created.body()).unwrap();
        let id = body["id"].as_str().unwrap().to_string();

        let fetched = warp::test::request().path(&format!("/routes/{id}")).reply(&filter).await;
        assert_eq!(fetched.status(), 200);

        let listed = warp::test::request().path("/routes").reply(&filter).await;
        assert_eq!(listed.status(), 200);
        let routes: Vec<serde_json::Value> = serde_json::from_slice(listed.body()).unwrap();
        assert_eq!(routes.len(), 1);
    }

    #[tokio::test]
    async fn post_with_unknown_adapter_kind_is_400() {
        let filter = make_routes(test_registry());
        let resp = warp::test::request()
            .method("POST")
            .path("/routes")
            .json(&serde_json::json!({"adapter": "nonexistent", "address": "a"}))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn get_missing_route_is_404() {
        let filter = make_routes(test_registry());
        let resp = warp::test::request().path("/routes/does-not-exist").reply(&filter).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn delete_missing_route_is_404() {
        let filter = make_routes(test_registry());
        let resp = warp::test::request()
            .method("DELETE")
            .path("/routes/does-not-exist")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn delete_existing_route_then_get_is_404() {
        let registry = test_registry();
        let filter = make_routes(registry.clone());

        let route = registry
            .add(stevedore_core::RouteDescriptor {
                id: None,
                filter_id: None,
                filter_name: None,
                filter_sources: None,
                filter_labels: None,
                adapter: "test".to_string(),
                address: "test://a".to_string(),
                options: None,
            })
            .await
            .unwrap();

        let resp = warp::test::request()
            .method("DELETE")
            .path(&format!("/routes/{}", route.id))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);

        let fetched = warp::test::request()
            .path(&format!("/routes/{}", route.id))
            .reply(&filter)
            .await;
        assert_eq!(fetched.status(), 404);
    }
}
