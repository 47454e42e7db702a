use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User is a member of the car-spotting network. Profile fields only;
/// secrets live in the credentials table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub bio: String,
    pub avatar_url: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// CarModel is a catalog entry that posts reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarModel {
    pub id: String,
    pub make: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Post is a single car sighting: who spotted what, where, and a photo.
/// Immutable after creation except `description` and `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub car_model_id: String,
    pub image_path: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Friendship is one direction of a symmetric relation: every stored
/// `(user_id, friend_id)` row has a mirrored `(friend_id, user_id)` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub user_id: String,
    pub friend_id: String,
    pub created_at: DateTime<Utc>,
}

/// FriendRequest is a directed pending proposal, keyed by the ordered
/// `(sender_id, receiver_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
}

// Request/Response types for API

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub car_model_id: String,
    pub image_path: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePostRequest {
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCarModelRequest {
    pub make: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SendFriendRequestRequest {
    pub receiver_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AddFriendshipRequest {
    pub user_id: String,
    pub friend_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
