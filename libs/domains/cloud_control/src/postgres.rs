//! `PgStore`: the `Store` trait over Postgres, built on
//! `database::BaseRepository` plus manual `ActiveModel` reconstruction for
//! updates.

use async_trait::async_trait;
use database::BaseRepository;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::{
    entity::{cloud_instances, dedicated_hosts},
    error::{CloudControlError, CloudControlResult},
    models::{CloudInstance, CloudInstanceFilter, DedicatedHost, HostState},
    store::Store,
};

pub struct PgStore {
    instances: BaseRepository<cloud_instances::Entity>,
    hosts: BaseRepository<dedicated_hosts::Entity>,
    db: DatabaseConnection,
}

impl PgStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            instances: BaseRepository::new(db.clone()),
            hosts: BaseRepository::new(db.clone()),
            db,
        }
    }

    fn internal(e: impl std::fmt::Display) -> CloudControlError {
        CloudControlError::Internal(format!("database error: {e}"))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_cloud_instance(&self, instance: CloudInstance) -> CloudControlResult<CloudInstance> {
        let active_model = cloud_instances::to_active_model(&instance);
        let model = self.instances.insert(active_model).await.map_err(Self::internal)?;
        Ok(model.into())
    }

    async fn get_cloud_instance(&self, id: Uuid) -> CloudControlResult<Option<CloudInstance>> {
        let model = self.instances.find_by_id(id).await.map_err(Self::internal)?;
        Ok(model.map(Into::into))
    }

    async fn get_cloud_instance_by_agent_node_id(
        &self,
        agent_node_id: &str,
    ) -> CloudControlResult<Option<CloudInstance>> {
        let model = cloud_instances::Entity::find()
            .filter(cloud_instances::Column::AgentNodeId.eq(agent_node_id))
            .one(&self.db)
            .await
            .map_err(Self::internal)?;
        Ok(model.map(Into::into))
    }

    async fn update_cloud_instance(&self, instance: CloudInstance) -> CloudControlResult<CloudInstance> {
        let active_model = cloud_instances::to_active_model(&instance);
        let model = self.instances.update(active_model).await.map_err(Self::internal)?;
        Ok(model.into())
    }

    async fn delete_cloud_instance(&self, id: Uuid) -> CloudControlResult<()> {
        self.instances.delete_by_id(id).await.map_err(Self::internal)?;
        Ok(())
    }

    async fn list_cloud_instances(&self, filter: &CloudInstanceFilter) -> CloudControlResult<Vec<CloudInstance>> {
        let mut query = cloud_instances::Entity::find();

        if let Some(platform) = filter.platform {
            query = query.filter(cloud_instances::Column::Platform.eq(platform.to_string()));
        }
        if let Some(state) = filter.state {
            query = query.filter(cloud_instances::Column::State.eq(state.to_string()));
        }
        if let Some(team_id) = &filter.team_id {
            query = query.filter(cloud_instances::Column::TeamId.eq(team_id.clone()));
        }
        if let Some(provider) = filter.provider {
            query = query.filter(cloud_instances::Column::Provider.eq(provider.to_string()));
        }

        let models = query
            .order_by_desc(cloud_instances::Column::CreatedAt)
            .limit(filter.limit.min(u32::MAX as usize) as u64)
            .offset(filter.offset as u64)
            .all(&self.db)
            .await
            .map_err(Self::internal)?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn count_cloud_instances_by_team(&self, team_id: &str) -> CloudControlResult<usize> {
        use crate::models::InstanceState;

        let count = cloud_instances::Entity::find()
            .filter(cloud_instances::Column::TeamId.eq(team_id))
            .filter(cloud_instances::Column::State.ne(InstanceState::Terminated.to_string()))
            .filter(cloud_instances::Column::State.ne(InstanceState::Failed.to_string()))
            .count(&self.db)
            .await
            .map_err(Self::internal)?;

        Ok(count as usize)
    }

    async fn create_dedicated_host(&self, host: DedicatedHost) -> CloudControlResult<DedicatedHost> {
        let active_model = dedicated_hosts::to_active_model(&host);
        let model = self.hosts.insert(active_model).await.map_err(Self::internal)?;
        Ok(model.into())
    }

    async fn get_dedicated_host(&self, id: Uuid) -> CloudControlResult<Option<DedicatedHost>> {
        let model = self.hosts.find_by_id(id).await.map_err(Self::internal)?;
        Ok(model.map(Into::into))
    }

    async fn get_dedicated_host_by_host_id(&self, host_id: &str) -> CloudControlResult<Option<DedicatedHost>> {
        let model = dedicated_hosts::Entity::find()
            .filter(dedicated_hosts::Column::HostId.eq(host_id))
            .one(&self.db)
            .await
            .map_err(Self::internal)?;
        Ok(model.map(Into::into))
    }

    async fn update_dedicated_host(&self, host: DedicatedHost) -> CloudControlResult<DedicatedHost> {
        let active_model = dedicated_hosts::to_active_model(&host);
        let model = self.hosts.update(active_model).await.map_err(Self::internal)?;
        Ok(model.into())
    }

    async fn list_dedicated_hosts(&self) -> CloudControlResult<Vec<DedicatedHost>> {
        let models = dedicated_hosts::Entity::find()
            .order_by_asc(dedicated_hosts::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(Self::internal)?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn get_available_dedicated_host(&self) -> CloudControlResult<Option<DedicatedHost>> {
        let model = dedicated_hosts::Entity::find()
            .filter(dedicated_hosts::Column::State.eq(HostState::Available.to_string()))
            .order_by_asc(dedicated_hosts::Column::UpdatedAt)
            .one(&self.db)
            .await
            .map_err(Self::internal)?;
        Ok(model.map(Into::into))
    }
}
