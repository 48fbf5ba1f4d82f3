use sea_orm::entity::prelude::*;
use sea_orm::UpdateMany;
use sea_orm::sea_query::Expr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "archives")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub shoot_id: String,
    pub archive_type: ArchiveType,
    pub status: ArchiveStatus,
    #[sea_orm(default_value = 0)]
    pub size_bytes: i64,
    pub estimated_size_bytes: i64,
    #[sea_orm(column_type = "Json")]
    pub file_ids: Json,
    pub file_count: i32,
    pub download_path: String,
    pub error_message: Option<String>,
    pub created_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
    pub expires_at: Option<DateTimeUtc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveType {
    #[sea_orm(string_value = "subset-jpeg")]
    SubsetJpeg,
    #[sea_orm(string_value = "subset-raw")]
    SubsetRaw,
    #[sea_orm(string_value = "complete")]
    Complete,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Pending => "pending",
            ArchiveStatus::Processing => "processing",
            ArchiveStatus::Completed => "completed",
            ArchiveStatus::Failed => "failed",
            ArchiveStatus::Expired => "expired",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ArchiveStatus) -> bool {
        matches!(
            (self, next),
            (ArchiveStatus::Pending, ArchiveStatus::Processing)
                | (ArchiveStatus::Pending, ArchiveStatus::Failed)
                | (ArchiveStatus::Processing, ArchiveStatus::Completed)
                | (ArchiveStatus::Processing, ArchiveStatus::Failed)
                | (ArchiveStatus::Completed, ArchiveStatus::Expired)
        )
    }
}

/// Conditional status update: only rows still in `from` move to `to`.
/// Callers add the id filter and any extra columns, then check
/// `rows_affected` to learn whether they won.
pub fn transition(from: ArchiveStatus, to: ArchiveStatus) -> UpdateMany<Entity> {
    debug_assert!(
        from.can_transition_to(to),
        "illegal archive transition {} -> {}",
        from.as_str(),
        to.as_str()
    );
    Entity::update_many()
        .col_expr(Column::Status, Expr::value(to.as_str()))
        .filter(Column::Status.eq(from))
}

impl Model {
    /// File ids captured when the archive was requested.
    pub fn file_id_list(&self) -> Vec<String> {
        serde_json::from_value(self.file_ids.clone()).unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.status == ArchiveStatus::Expired || self.expires_at.is_some_and(|exp| now > exp)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
