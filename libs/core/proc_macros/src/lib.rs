// Re-export proc macros when their features are enabled
#[cfg(feature = "sea_orm_resource")]
pub use sea_orm_resource::SeaOrmResource;

/// Trait for REST API resource metadata.
///
/// This trait provides constants for resource URLs, database collection names,
/// and API documentation tags. It is derived for sea-orm entities via
/// [`SeaOrmResource`].
pub trait ApiResource {
    /// The base URL path for this resource (e.g., "/user")
    const URL: &'static str;
    /// The full API URL path including the /api prefix (e.g., "/api/user")
    const API_URL: &'static str;
    /// The database collection or table name (e.g., "users")
    const COLLECTION: &'static str;
    /// The API documentation tag (e.g., "Users")
    const TAG: &'static str;
}
