use crate::models::{
    CloudInstance, ConnectionInfo, DedicatedHost, HostState, InstanceState, Platform, ProviderKind,
};
use core_proc_macros::SeaOrmResource;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod cloud_instances {
    use super::*;

    /// Sea-ORM entity for the `cloud_instances` table (§3 CloudInstance, §6 persisted layout).
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, SeaOrmResource)]
    #[sea_orm(table_name = "cloud_instances")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub instance_id: String,
        pub platform: String,
        pub provider: String,
        pub region: String,
        pub instance_type: String,
        pub image_id: String,
        pub state: String,
        pub bot_package: String,
        pub bot_version: Option<String>,
        pub team_id: String,
        #[sea_orm(column_name = "agent_node_id")]
        pub agent_node_id: Option<String>,
        pub public_ip: Option<String>,
        pub private_ip: Option<String>,
        pub hourly_rate_cents: i64,
        pub accrued_cost_cents: i64,
        pub billing_tier: Option<String>,
        pub dedicated_host_id: Option<Uuid>,
        pub connection_info: Option<Json>,
        pub tags: Json,
        pub metadata: Json,
        pub error_message: Option<String>,
        pub requested_at: DateTimeWithTimeZone,
        pub provisioned_at: Option<DateTimeWithTimeZone>,
        pub terminated_at: Option<DateTimeWithTimeZone>,
        pub created_at: DateTimeWithTimeZone,
        pub updated_at: DateTimeWithTimeZone,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::dedicated_hosts::Entity",
            from = "Column::DedicatedHostId",
            to = "super::dedicated_hosts::Column::Id"
        )]
        DedicatedHost,
    }

    impl Related<super::dedicated_hosts::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::DedicatedHost.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}

    impl From<Model> for CloudInstance {
        fn from(m: Model) -> Self {
            let platform = m.platform.parse::<Platform>().expect("invalid platform in database");
            let provider = m.provider.parse::<ProviderKind>().expect("invalid provider in database");
            let state = m.state.parse::<InstanceState>().expect("invalid state in database");
            let tags: BTreeMap<String, String> = serde_json::from_value(m.tags).unwrap_or_default();
            let connection_info: Option<ConnectionInfo> = m
                .connection_info
                .and_then(|v| serde_json::from_value(v).ok());

            Self {
                id: m.id,
                instance_id: m.instance_id,
                platform,
                provider,
                region: m.region,
                instance_type: m.instance_type,
                image_id: m.image_id,
                state,
                bot_package: m.bot_package,
                bot_version: m.bot_version,
                team_id: m.team_id,
                agent_node_id: m.agent_node_id,
                public_ip: m.public_ip,
                private_ip: m.private_ip,
                hourly_rate_cents: m.hourly_rate_cents,
                accrued_cost_cents: m.accrued_cost_cents,
                billing_tier: m.billing_tier,
                dedicated_host_id: m.dedicated_host_id,
                connection_info,
                tags,
                metadata: m.metadata,
                error_message: m.error_message,
                requested_at: m.requested_at.into(),
                provisioned_at: m.provisioned_at.map(Into::into),
                terminated_at: m.terminated_at.map(Into::into),
                created_at: m.created_at.into(),
                updated_at: m.updated_at.into(),
            }
        }
    }

    /// Round-trips a domain `CloudInstance` back into an `ActiveModel` for
    /// insert/update via manual field-by-field reconstruction.
    pub fn to_active_model(instance: &CloudInstance) -> ActiveModel {
        use sea_orm::ActiveValue::Set;
        ActiveModel {
            id: Set(instance.id),
            instance_id: Set(instance.instance_id.clone()),
            platform: Set(instance.platform.to_string()),
            provider: Set(instance.provider.to_string()),
            region: Set(instance.region.clone()),
            instance_type: Set(instance.instance_type.clone()),
            image_id: Set(instance.image_id.clone()),
            state: Set(instance.state.to_string()),
            bot_package: Set(instance.bot_package.clone()),
            bot_version: Set(instance.bot_version.clone()),
            team_id: Set(instance.team_id.clone()),
            agent_node_id: Set(instance.agent_node_id.clone()),
            public_ip: Set(instance.public_ip.clone()),
            private_ip: Set(instance.private_ip.clone()),
            hourly_rate_cents: Set(instance.hourly_rate_cents),
            accrued_cost_cents: Set(instance.accrued_cost_cents),
            billing_tier: Set(instance.billing_tier.clone()),
            dedicated_host_id: Set(instance.dedicated_host_id),
            connection_info: Set(instance
                .connection_info
                .as_ref()
                .map(|c| serde_json::to_value(c).expect("serialize connection_info"))),
            tags: Set(serde_json::to_value(&instance.tags).expect("serialize tags")),
            metadata: Set(instance.metadata.clone()),
            error_message: Set(instance.error_message.clone()),
            requested_at: Set(instance.requested_at.into()),
            provisioned_at: Set(instance.provisioned_at.map(Into::into)),
            terminated_at: Set(instance.terminated_at.map(Into::into)),
            created_at: Set(instance.created_at.into()),
            updated_at: Set(instance.updated_at.into()),
        }
    }
}

pub mod dedicated_hosts {
    use super::*;

    /// Sea-ORM entity for the `dedicated_hosts` table (§3 DedicatedHost).
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, SeaOrmResource)]
    #[sea_orm(table_name = "dedicated_hosts")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub host_id: String,
        pub instance_type: String,
        pub state: String,
        pub current_instance_id: Option<Uuid>,
        pub allocated_at: Option<DateTimeWithTimeZone>,
        pub released_at: Option<DateTimeWithTimeZone>,
        pub min_allocation_secs: i64,
        pub created_at: DateTimeWithTimeZone,
        pub updated_at: DateTimeWithTimeZone,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}

    impl From<Model> for DedicatedHost {
        fn from(m: Model) -> Self {
            let state = m.state.parse::<HostState>().expect("invalid host state in database");
            Self {
                id: m.id,
                host_id: m.host_id,
                instance_type: m.instance_type,
                state,
                current_instance_id: m.current_instance_id,
                allocated_at: m.allocated_at.map(Into::into),
                released_at: m.released_at.map(Into::into),
                min_allocation_secs: m.min_allocation_secs,
                created_at: m.created_at.into(),
                updated_at: m.updated_at.into(),
            }
        }
    }

    pub fn to_active_model(host: &DedicatedHost) -> ActiveModel {
        use sea_orm::ActiveValue::Set;
        ActiveModel {
            id: Set(host.id),
            host_id: Set(host.host_id.clone()),
            instance_type: Set(host.instance_type.clone()),
            state: Set(host.state.to_string()),
            current_instance_id: Set(host.current_instance_id),
            allocated_at: Set(host.allocated_at.map(Into::into)),
            released_at: Set(host.released_at.map(Into::into)),
            min_allocation_secs: Set(host.min_allocation_secs),
            created_at: Set(host.created_at.into()),
            updated_at: Set(host.updated_at.into()),
        }
    }
}
