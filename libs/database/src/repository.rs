//! Generic SeaORM repository base shared by domain crates.
//!
//! Domain crates wrap this in their own trait-bound repository (see
//! `domain_cloud_control::postgres::PgStore` for the pattern) rather than
//! exposing `BaseRepository` directly at their API boundary.

use crate::common::{DatabaseError, DatabaseResult};
use sea_orm::{DatabaseConnection, DeleteResult, EntityTrait, PrimaryKeyTrait};
use uuid::Uuid;

/// Marker for entities keyed by a `Uuid` primary key, the shape every
/// domain entity in this workspace uses.
pub trait UuidEntity: EntityTrait<PrimaryKey = Self::UuidPrimaryKey> {
    type UuidPrimaryKey: PrimaryKeyTrait<ValueType = Uuid>;
}

impl<E> UuidEntity for E
where
    E: EntityTrait,
    E::PrimaryKey: PrimaryKeyTrait<ValueType = Uuid>,
{
    type UuidPrimaryKey = E::PrimaryKey;
}

/// Thin wrapper around a `DatabaseConnection` scoped to one entity,
/// providing the handful of operations every domain repository needs.
pub struct BaseRepository<E: EntityTrait> {
    db: DatabaseConnection,
    _entity: std::marker::PhantomData<E>,
}

impl<E: EntityTrait> BaseRepository<E> {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            _entity: std::marker::PhantomData,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn insert(&self, model: E::ActiveModel) -> DatabaseResult<E::Model>
    where
        E::ActiveModel: sea_orm::ActiveModelTrait<Entity = E> + Send,
    {
        let inserted = E::insert(model)
            .exec_with_returning(&self.db)
            .await
            .map_err(DatabaseError::Postgres)?;
        Ok(inserted)
    }

    pub async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<E::Model>>
    where
        E: UuidEntity,
    {
        E::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(DatabaseError::Postgres)
    }

    pub async fn update(&self, model: E::ActiveModel) -> DatabaseResult<E::Model>
    where
        E::ActiveModel: sea_orm::ActiveModelTrait<Entity = E> + Send,
    {
        model.update(&self.db).await.map_err(DatabaseError::Postgres)
    }

    pub async fn delete_by_id(&self, id: Uuid) -> DatabaseResult<u64>
    where
        E: UuidEntity,
    {
        let result: DeleteResult = E::delete_by_id(id)
            .exec(&self.db)
            .await
            .map_err(DatabaseError::Postgres)?;
        Ok(result.rows_affected)
    }
}

// BaseRepository is exercised indirectly through each domain crate's
// postgres.rs against a real database; there is no fake SeaORM connection
// in this workspace's test tooling to unit test it in isolation.
