use actix_web::{test, web, App};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use spotted_backend::api::{self, AppState};
use spotted_backend::auth::AuthService;
use spotted_backend::models::{CarModel, User};
use spotted_backend::store::Store;

/// Helper to create a test user and return their auth token
fn create_test_user_with_token(
    store: &Arc<Store>,
    auth_service: &Arc<AuthService>,
    username: &str,
) -> (User, String) {
    let mut user = User {
        id: String::new(),
        username: username.to_string(),
        email: format!("{}@test.com", username),
        display_name: username.to_string(),
        bio: String::new(),
        avatar_url: String::new(),
        is_admin: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    store.create_user(&mut user).unwrap();
    let token = auth_service.generate_token(&user.id).unwrap();
    (user, token)
}

fn create_car_model(store: &Arc<Store>) -> CarModel {
    let mut model = CarModel {
        id: String::new(),
        make: "Honda".to_string(),
        name: "NSX".to_string(),
        created_at: Utc::now(),
    };
    store.create_car_model(&mut model).unwrap();
    model
}

macro_rules! init_app {
    ($store:expr, $auth:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new($store.clone(), $auth.clone())))
                .configure(api::configure_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn test_create_and_get_post() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (user, token) = create_test_user_with_token(&store, &auth_service, "spotter");
    let model = create_car_model(&store);

    let app = init_app!(store, auth_service);

    let req = test::TestRequest::post()
        .uri("/api/posts")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({
            "car_model_id": model.id,
            "image_path": "uploads/nsx.jpg",
            "description": "parked outside the bakery",
            "latitude": 35.68,
            "longitude": 139.77,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    let post_id = body["data"]["id"].as_str().unwrap().to_string();
    assert!(!post_id.is_empty());
    assert_eq!(body["data"]["user_id"].as_str().unwrap(), user.id);

    let req = test::TestRequest::get()
        .uri(&format!("/api/posts/{}", post_id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(
        body["data"]["description"].as_str().unwrap(),
        "parked outside the bakery"
    );
}

#[actix_web::test]
async fn test_create_post_with_unknown_car_model_rejected() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_user, token) = create_test_user_with_token(&store, &auth_service, "spotter");

    let app = init_app!(store, auth_service);

    let req = test::TestRequest::post()
        .uri("/api/posts")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({
            "car_model_id": "no-such-model",
            "image_path": "uploads/x.jpg",
            "latitude": 0.0,
            "longitude": 0.0,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn test_only_description_is_editable_and_only_by_owner() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_owner, owner_token) = create_test_user_with_token(&store, &auth_service, "owner");
    let (_other, other_token) = create_test_user_with_token(&store, &auth_service, "other");
    let model = create_car_model(&store);

    let app = init_app!(store, auth_service);

    let req = test::TestRequest::post()
        .uri("/api/posts")
        .insert_header(("Authorization", format!("Bearer {}", owner_token)))
        .set_json(json!({
            "car_model_id": model.id,
            "image_path": "uploads/nsx.jpg",
            "latitude": 35.68,
            "longitude": 139.77,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let post_id = body["data"]["id"].as_str().unwrap().to_string();

    // A non-owner cannot edit.
    let req = test::TestRequest::put()
        .uri(&format!("/api/posts/{}", post_id))
        .insert_header(("Authorization", format!("Bearer {}", other_token)))
        .set_json(json!({ "description": "hijacked" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::put()
        .uri(&format!("/api/posts/{}", post_id))
        .insert_header(("Authorization", format!("Bearer {}", owner_token)))
        .set_json(json!({ "description": "actually a Type S" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(
        body["data"]["description"].as_str().unwrap(),
        "actually a Type S"
    );
}

#[actix_web::test]
async fn test_delete_post_by_owner_only() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_owner, owner_token) = create_test_user_with_token(&store, &auth_service, "owner");
    let (_other, other_token) = create_test_user_with_token(&store, &auth_service, "other");
    let model = create_car_model(&store);

    let app = init_app!(store, auth_service);

    let req = test::TestRequest::post()
        .uri("/api/posts")
        .insert_header(("Authorization", format!("Bearer {}", owner_token)))
        .set_json(json!({
            "car_model_id": model.id,
            "image_path": "uploads/nsx.jpg",
            "latitude": 35.68,
            "longitude": 139.77,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let post_id = body["data"]["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}", post_id))
        .insert_header(("Authorization", format!("Bearer {}", other_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}", post_id))
        .insert_header(("Authorization", format!("Bearer {}", owner_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get()
        .uri(&format!("/api/posts/{}", post_id))
        .insert_header(("Authorization", format!("Bearer {}", owner_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn test_car_model_catalog() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_user, token) = create_test_user_with_token(&store, &auth_service, "spotter");

    let app = init_app!(store, auth_service);

    let req = test::TestRequest::post()
        .uri("/api/car-models")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({ "make": "Lancia", "name": "Stratos" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let req = test::TestRequest::get()
        .uri("/api/car-models")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    let models = body["data"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"].as_str().unwrap(), "Stratos");
}
