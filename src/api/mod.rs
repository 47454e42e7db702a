use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{AuthService, AuthUser};
use crate::models::*;
use crate::store::feed::{FeedQuery, FeedQueryEngine};
use crate::store::friends::FriendRequestWorkflow;
use crate::store::{is_foreign_key_violation, Store, StoreError};

pub struct AppState {
    pub store: Arc<Store>,
    pub auth_service: Arc<AuthService>,
    pub friends: Arc<FriendRequestWorkflow>,
    pub feed: Arc<FeedQueryEngine>,
}

impl AppState {
    pub fn new(store: Arc<Store>, auth_service: Arc<AuthService>) -> Self {
        let friends = Arc::new(store.friend_requests());
        let feed = Arc::new(store.feed());
        Self {
            store,
            auth_service,
            friends,
            feed,
        }
    }
}

/// Map engine failures onto transport statuses: validation to 400,
/// conflicts to 409, missing rows to 404, everything else to 500.
fn error_response(err: StoreError) -> HttpResponse {
    let body = ApiResponse::<()>::error(err.to_string());
    match err {
        StoreError::SelfFriendship
        | StoreError::InvalidLimit(_)
        | StoreError::BadCursor
        | StoreError::IncompleteGeoFilter => HttpResponse::BadRequest().json(body),
        StoreError::DuplicateRequest | StoreError::AlreadyFriends => {
            HttpResponse::Conflict().json(body)
        }
        StoreError::NotFound(_) | StoreError::RequestNotFound => {
            HttpResponse::NotFound().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

// ==================== Health Check ====================

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

// ==================== Auth Endpoints ====================

pub async fn register(
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> impl Responder {
    let password_hash = match state.auth_service.hash_password(&body.password) {
        Ok(hash) => hash,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Failed to hash password"))
        }
    };

    let mut user = User {
        id: String::new(),
        username: body.username.clone(),
        email: body.email.clone(),
        display_name: body
            .display_name
            .clone()
            .unwrap_or_else(|| body.username.clone()),
        bio: String::new(),
        avatar_url: String::new(),
        is_admin: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    if let Err(e) = state.store.create_user(&mut user) {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error(format!("Failed to create user: {}", e)));
    }
    if let Err(e) = state
        .store
        .create_password_credential(&user.id, &password_hash)
    {
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to store credential: {}", e)));
    }

    let token = match state.auth_service.generate_token(&user.id) {
        Ok(t) => t,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Failed to generate token"))
        }
    };

    HttpResponse::Created().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> impl Responder {
    let user = match state.store.get_user_by_username(&body.username) {
        Ok(u) => u,
        Err(StoreError::NotFound(_)) => {
            return HttpResponse::Unauthorized()
                .json(ApiResponse::<()>::error("Invalid credentials"));
        }
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Database error"));
        }
    };

    let password_hash = match state.store.password_hash_for(&user.id) {
        Ok(h) => h,
        Err(StoreError::NotFound(_)) => {
            return HttpResponse::Unauthorized()
                .json(ApiResponse::<()>::error("Invalid credentials"));
        }
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Database error"));
        }
    };

    let valid = state
        .auth_service
        .verify_password(&body.password, &password_hash)
        .unwrap_or(false);
    if !valid {
        return HttpResponse::Unauthorized().json(ApiResponse::<()>::error("Invalid credentials"));
    }

    let token = match state.auth_service.generate_token(&user.id) {
        Ok(t) => t,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Failed to generate token"))
        }
    };

    HttpResponse::Ok().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn get_current_user(state: web::Data<AppState>, auth: AuthUser) -> impl Responder {
    match state.store.get_user(&auth.user_id) {
        Ok(user) => HttpResponse::Ok().json(ApiResponse::success(user)),
        Err(_) => HttpResponse::NotFound().json(ApiResponse::<()>::error("User not found")),
    }
}

/// Deleting an account also removes its credentials, friendships, pending
/// requests and posts via the store's cascades.
pub async fn delete_account(state: web::Data<AppState>, auth: AuthUser) -> impl Responder {
    match state.store.delete_user(&auth.user_id) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(e),
    }
}

// ==================== Friend Endpoints ====================

pub async fn list_friends(state: web::Data<AppState>, auth: AuthUser) -> impl Responder {
    match state.friends.graph().list_friends(&auth.user_id) {
        Ok(friends) => HttpResponse::Ok().json(ApiResponse::success(friends)),
        Err(e) => error_response(e),
    }
}

pub async fn remove_friend(
    state: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let friend_id = path.into_inner();
    match state.friends.graph().remove_friendship(&auth.user_id, &friend_id) {
        // 0 means the friendship did not exist; callers branch on the count.
        Ok(deleted) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "deleted": deleted
        }))),
        Err(e) => error_response(e),
    }
}

pub async fn list_friend_requests(state: web::Data<AppState>, auth: AuthUser) -> impl Responder {
    match state.friends.get_all_friend_requests(&auth.user_id) {
        Ok(users) => HttpResponse::Ok().json(ApiResponse::success(users)),
        Err(e) => error_response(e),
    }
}

pub async fn send_friend_request(
    state: web::Data<AppState>,
    auth: AuthUser,
    body: web::Json<SendFriendRequestRequest>,
) -> impl Responder {
    match state
        .friends
        .send_friend_request(&auth.user_id, &body.receiver_id)
    {
        Ok(request) => HttpResponse::Created().json(ApiResponse::success(request)),
        Err(e) => error_response(e),
    }
}

/// The authenticated user accepts a request sent to them.
pub async fn accept_friend_request(
    state: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let sender_id = path.into_inner();
    match state
        .friends
        .accept_friend_request(&sender_id, &auth.user_id)
    {
        Ok(accepted) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "accepted": accepted
        }))),
        Err(e) => error_response(e),
    }
}

pub async fn decline_friend_request(
    state: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let sender_id = path.into_inner();
    match state
        .friends
        .decline_friend_request(&sender_id, &auth.user_id)
    {
        Ok(deleted) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "deleted": deleted
        }))),
        Err(e) => error_response(e),
    }
}

// ==================== Admin Endpoints ====================

fn require_admin(state: &AppState, auth: &AuthUser) -> Result<(), HttpResponse> {
    match state.store.get_user(&auth.user_id) {
        Ok(user) if user.is_admin => Ok(()),
        Ok(_) => Err(HttpResponse::Forbidden().json(ApiResponse::<()>::error("Admin only"))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn admin_add_friendship(
    state: web::Data<AppState>,
    auth: AuthUser,
    body: web::Json<AddFriendshipRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&state, &auth) {
        return resp;
    }
    match state
        .friends
        .graph()
        .add_friendship(&body.user_id, &body.friend_id)
    {
        Ok(friendship) => HttpResponse::Created().json(ApiResponse::success(friendship)),
        Err(e) => error_response(e),
    }
}

pub async fn admin_list_friendships(state: web::Data<AppState>, auth: AuthUser) -> impl Responder {
    if let Err(resp) = require_admin(&state, &auth) {
        return resp;
    }
    match state.friends.graph().list_all_friendships() {
        Ok(friendships) => HttpResponse::Ok().json(ApiResponse::success(friendships)),
        Err(e) => error_response(e),
    }
}

// ==================== Feed Endpoint ====================

#[derive(Deserialize)]
pub struct FeedParams {
    user_id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    radius_km: Option<f64>,
    limit: Option<i64>,
    cursor: Option<String>,
}

pub async fn get_feed(
    state: web::Data<AppState>,
    _auth: AuthUser,
    params: web::Query<FeedParams>,
) -> impl Responder {
    let query = FeedQuery {
        user_id: params.user_id.clone(),
        latitude: params.latitude,
        longitude: params.longitude,
        radius_km: params.radius_km,
        limit: params.limit.unwrap_or(50).min(100),
        cursor: params.cursor.clone(),
    };

    match state.feed.get_feed(&query) {
        Ok(page) => HttpResponse::Ok().json(ApiResponse::success(page)),
        Err(e) => error_response(e),
    }
}

// ==================== Post Endpoints ====================

pub async fn create_post(
    state: web::Data<AppState>,
    auth: AuthUser,
    body: web::Json<CreatePostRequest>,
) -> impl Responder {
    let mut post = Post {
        id: String::new(),
        user_id: auth.user_id.clone(),
        car_model_id: body.car_model_id.clone(),
        image_path: body.image_path.clone(),
        description: body.description.clone(),
        latitude: body.latitude,
        longitude: body.longitude,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    match state.store.create_post(&mut post) {
        Ok(()) => HttpResponse::Created().json(ApiResponse::success(post)),
        Err(StoreError::Database(e)) if is_foreign_key_violation(&e) => HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error("Unknown car model or user")),
        Err(e) => error_response(e),
    }
}

pub async fn get_post(
    state: web::Data<AppState>,
    _auth: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    match state.store.get_post(&path.into_inner()) {
        Ok(post) => HttpResponse::Ok().json(ApiResponse::success(post)),
        Err(e) => error_response(e),
    }
}

pub async fn update_post(
    state: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<String>,
    body: web::Json<UpdatePostRequest>,
) -> impl Responder {
    let id = path.into_inner();
    let mut post = match state.store.get_post(&id) {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };

    // Check ownership
    if post.user_id != auth.user_id {
        return HttpResponse::NotFound().json(ApiResponse::<()>::error("Post not found"));
    }

    post.description = body.description.clone();
    match state.store.update_post_description(&mut post) {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::success(post)),
        Err(e) => error_response(e),
    }
}

pub async fn delete_post(
    state: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();

    // Verify ownership first
    match state.store.get_post(&id) {
        Ok(post) => {
            if post.user_id != auth.user_id {
                return HttpResponse::NotFound().json(ApiResponse::<()>::error("Post not found"));
            }
        }
        Err(e) => return error_response(e),
    }

    match state.store.delete_post(&id) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(e),
    }
}

// ==================== Car Model Endpoints ====================

pub async fn list_car_models(state: web::Data<AppState>, _auth: AuthUser) -> impl Responder {
    match state.store.list_car_models() {
        Ok(models) => HttpResponse::Ok().json(ApiResponse::success(models)),
        Err(e) => error_response(e),
    }
}

pub async fn create_car_model(
    state: web::Data<AppState>,
    _auth: AuthUser,
    body: web::Json<CreateCarModelRequest>,
) -> impl Responder {
    let mut model = CarModel {
        id: String::new(),
        make: body.make.clone(),
        name: body.name.clone(),
        created_at: Utc::now(),
    };
    match state.store.create_car_model(&mut model) {
        Ok(()) => HttpResponse::Created().json(ApiResponse::success(model)),
        Err(e) => HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error(format!("Failed to create car model: {}", e))),
    }
}

// ==================== Route Configuration ====================

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check
        .route("/health", web::get().to(health))

        // Auth routes (no auth required)
        .route("/api/auth/register", web::post().to(register))
        .route("/api/auth/login", web::post().to(login))

        // Account
        .route("/api/auth/me", web::get().to(get_current_user))
        .route("/api/auth/me", web::delete().to(delete_account))

        // Social graph
        .route("/api/friends", web::get().to(list_friends))
        .route("/api/friends/requests", web::get().to(list_friend_requests))
        .route("/api/friends/requests", web::post().to(send_friend_request))
        .route("/api/friends/requests/{sender_id}/accept", web::post().to(accept_friend_request))
        .route("/api/friends/requests/{sender_id}/decline", web::post().to(decline_friend_request))
        .route("/api/friends/{friend_id}", web::delete().to(remove_friend))
        .route("/api/admin/friendships", web::get().to(admin_list_friendships))
        .route("/api/admin/friendships", web::post().to(admin_add_friendship))

        // Feed
        .route("/api/feed", web::get().to(get_feed))

        // Posts
        .route("/api/posts", web::post().to(create_post))
        .route("/api/posts/{id}", web::get().to(get_post))
        .route("/api/posts/{id}", web::put().to(update_post))
        .route("/api/posts/{id}", web::delete().to(delete_post))

        // Car models
        .route("/api/car-models", web::get().to(list_car_models))
        .route("/api/car-models", web::post().to(create_car_model));
}
