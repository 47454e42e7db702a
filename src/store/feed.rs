//! Feed queries: reverse-chronological, optionally geo-filtered,
//! cursor-paginated pages over the posts table.
//!
//! Ordering is `(created_at DESC, id DESC)`; post ids are time-ordered
//! UUIDs, so the tie-break is always decisive. Pages are fetched keyset
//! style (`created_at < ? OR (created_at = ? AND id < ?)`), which stays
//! stable while new posts land at the head of the feed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::models::Post;

use super::{fmt_ts, row_to_post, StoreError, StoreResult};

pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance in kilometres, spherical-earth haversine.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Keyset watermark: the `(created_at, id)` of the last row of the previous
/// page. Round-tripped by callers as an opaque base64 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCursor {
    pub last_created_at: DateTime<Utc>,
    pub last_post_id: String,
}

impl FeedCursor {
    pub fn encode(&self) -> StoreResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// Any failure to decode is a caller error, collapsed to `BadCursor`.
    pub fn decode(raw: &str) -> StoreResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| StoreError::BadCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| StoreError::BadCursor)
    }
}

/// Parameters for one feed page.
#[derive(Debug, Clone, Default)]
pub struct FeedQuery {
    pub user_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_km: Option<f64>,
    pub limit: i64,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedPage {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Radius filter, present only when the full triple was supplied.
struct GeoFilter {
    latitude: f64,
    longitude: f64,
    radius_km: f64,
}

impl GeoFilter {
    fn from_query(query: &FeedQuery) -> StoreResult<Option<Self>> {
        match (query.latitude, query.longitude, query.radius_km) {
            (Some(latitude), Some(longitude), Some(radius_km)) => Ok(Some(Self {
                latitude,
                longitude,
                radius_km,
            })),
            (None, None, None) => Ok(None),
            _ => Err(StoreError::IncompleteGeoFilter),
        }
    }

    /// Rectangle guaranteed to contain the radius circle: a superset
    /// pre-filter, never a subset. The longitude span is computed at the
    /// widest latitude inside the band; near the poles or when the span
    /// would cross the antimeridian the longitude constraint is dropped
    /// and the exact distance check does all the work.
    fn bounding_box(&self) -> (f64, f64, Option<(f64, f64)>) {
        let lat_delta = (self.radius_km / EARTH_RADIUS_KM).to_degrees();
        let lat_min = self.latitude - lat_delta;
        let lat_max = self.latitude + lat_delta;

        let widest_lat = (self.latitude.abs() + lat_delta).min(90.0);
        let lon_span = if widest_lat >= 89.0 {
            None
        } else {
            let lon_delta = lat_delta / widest_lat.to_radians().cos();
            let lon_min = self.longitude - lon_delta;
            let lon_max = self.longitude + lon_delta;
            if lon_min < -180.0 || lon_max > 180.0 {
                None
            } else {
                Some((lon_min, lon_max))
            }
        };
        (lat_min, lat_max, lon_span)
    }
}

/// Read-only query engine over the posts table.
pub struct FeedQueryEngine {
    conn: Arc<Mutex<Connection>>,
}

impl FeedQueryEngine {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// One page of the feed. Fetches `limit + 1` rows; the extra row only
    /// tells us whether another page exists and is discarded.
    ///
    /// The radius boundary is inclusive: a post at exactly `radius_km` is
    /// part of the result.
    pub fn get_feed(&self, query: &FeedQuery) -> StoreResult<FeedPage> {
        if query.limit <= 0 {
            return Err(StoreError::InvalidLimit(query.limit));
        }
        let geo = GeoFilter::from_query(query)?;
        let cursor = match &query.cursor {
            Some(raw) => Some(FeedCursor::decode(raw)?),
            None => None,
        };

        let mut sql = String::from(
            "SELECT id, user_id, car_model_id, image_path, description, \
             latitude, longitude, created_at, updated_at FROM posts",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(user_id) = &query.user_id {
            clauses.push("user_id = ?");
            params.push(Box::new(user_id.clone()));
        }
        if let Some(geo) = &geo {
            let (lat_min, lat_max, lon_span) = geo.bounding_box();
            clauses.push("latitude BETWEEN ? AND ?");
            params.push(Box::new(lat_min));
            params.push(Box::new(lat_max));
            if let Some((lon_min, lon_max)) = lon_span {
                clauses.push("longitude BETWEEN ? AND ?");
                params.push(Box::new(lon_min));
                params.push(Box::new(lon_max));
            }
            clauses.push("haversine_km(latitude, longitude, ?, ?) <= ?");
            params.push(Box::new(geo.latitude));
            params.push(Box::new(geo.longitude));
            params.push(Box::new(geo.radius_km));
        }
        if let Some(cursor) = &cursor {
            clauses.push("(created_at < ? OR (created_at = ? AND id < ?))");
            let ts = fmt_ts(&cursor.last_created_at);
            params.push(Box::new(ts.clone()));
            params.push(Box::new(ts));
            params.push(Box::new(cursor.last_post_id.clone()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        params.push(Box::new(query.limit + 1));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut posts = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = posts.len() as i64 > query.limit;
        if has_more {
            posts.truncate(query.limit as usize);
        }
        let next_cursor = match posts.last() {
            Some(last) if has_more => Some(
                FeedCursor {
                    last_created_at: last.created_at,
                    last_post_id: last.id.clone(),
                }
                .encode()?,
            ),
            _ => None,
        };

        Ok(FeedPage {
            posts,
            next_cursor,
            has_more,
        })
    }
}
