use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DedicatedHosts::Table)
                    .if_not_exists()
                    .col(pk_uuid(DedicatedHosts::Id))
                    .col(string(DedicatedHosts::HostId))
                    .col(string(DedicatedHosts::InstanceType))
                    .col(string(DedicatedHosts::State).default("available"))
                    .col(uuid_null(DedicatedHosts::CurrentInstanceId))
                    .col(timestamp_with_time_zone_null(DedicatedHosts::AllocatedAt))
                    .col(timestamp_with_time_zone_null(DedicatedHosts::ReleasedAt))
                    .col(big_integer(DedicatedHosts::MinAllocationSecs))
                    .col(
                        timestamp_with_time_zone(DedicatedHosts::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(DedicatedHosts::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dedicated_hosts_state")
                    .table(DedicatedHosts::Table)
                    .col(DedicatedHosts::State)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("unique_dedicated_hosts_host_id")
                    .table(DedicatedHosts::Table)
                    .col(DedicatedHosts::HostId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DedicatedHosts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum DedicatedHosts {
    Table,
    Id,
    HostId,
    InstanceType,
    State,
    CurrentInstanceId,
    AllocatedAt,
    ReleasedAt,
    MinAllocationSecs,
    CreatedAt,
    UpdatedAt,
}
