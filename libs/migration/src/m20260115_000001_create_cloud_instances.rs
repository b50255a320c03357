use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CloudInstances::Table)
                    .if_not_exists()
                    .col(pk_uuid(CloudInstances::Id))
                    .col(string(CloudInstances::InstanceId))
                    .col(string(CloudInstances::Platform))
                    .col(string(CloudInstances::Provider))
                    .col(string(CloudInstances::Region))
                    .col(string(CloudInstances::InstanceType))
                    .col(string(CloudInstances::ImageId))
                    .col(string(CloudInstances::State))
                    .col(string(CloudInstances::BotPackage))
                    .col(string_null(CloudInstances::BotVersion))
                    .col(string(CloudInstances::TeamId))
                    .col(string_null(CloudInstances::AgentNodeId))
                    .col(string_null(CloudInstances::PublicIp))
                    .col(string_null(CloudInstances::PrivateIp))
                    .col(big_integer(CloudInstances::HourlyRateCents))
                    .col(big_integer(CloudInstances::AccruedCostCents).default(0))
                    .col(string_null(CloudInstances::BillingTier))
                    .col(uuid_null(CloudInstances::DedicatedHostId))
                    .col(json_null(CloudInstances::ConnectionInfo))
                    .col(json(CloudInstances::Tags).default("{}"))
                    .col(json(CloudInstances::Metadata).default("null"))
                    .col(string_null(CloudInstances::ErrorMessage))
                    .col(timestamp_with_time_zone(CloudInstances::RequestedAt))
                    .col(timestamp_with_time_zone_null(CloudInstances::ProvisionedAt))
                    .col(timestamp_with_time_zone_null(CloudInstances::TerminatedAt))
                    .col(
                        timestamp_with_time_zone(CloudInstances::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(CloudInstances::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_cloud_instances_dedicated_host_id")
                            .from(CloudInstances::Table, CloudInstances::DedicatedHostId)
                            .to(DedicatedHosts::Table, DedicatedHosts::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cloud_instances_team_id")
                    .table(CloudInstances::Table)
                    .col(CloudInstances::TeamId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cloud_instances_state")
                    .table(CloudInstances::Table)
                    .col(CloudInstances::State)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cloud_instances_platform")
                    .table(CloudInstances::Table)
                    .col(CloudInstances::Platform)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cloud_instances_created_at")
                    .table(CloudInstances::Table)
                    .col(CloudInstances::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("unique_cloud_instances_agent_node_id")
                    .table(CloudInstances::Table)
                    .col(CloudInstances::AgentNodeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CloudInstances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum CloudInstances {
    Table,
    Id,
    InstanceId,
    Platform,
    Provider,
    Region,
    InstanceType,
    ImageId,
    State,
    BotPackage,
    BotVersion,
    TeamId,
    AgentNodeId,
    PublicIp,
    PrivateIp,
    HourlyRateCents,
    AccruedCostCents,
    BillingTier,
    DedicatedHostId,
    ConnectionInfo,
    Tags,
    Metadata,
    ErrorMessage,
    RequestedAt,
    ProvisionedAt,
    TerminatedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DedicatedHosts {
    Table,
    Id,
}
