use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stored_files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub shoot_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[sea_orm(unique)]
    pub storage_path: String,
    pub kind: FileKind,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTimeUtc,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[sea_orm(string_value = "image")]
    Image,
    #[sea_orm(string_value = "raw")]
    Raw,
    #[sea_orm(string_value = "video")]
    Video,
    #[sea_orm(string_value = "sidecar")]
    Sidecar,
    #[sea_orm(string_value = "config")]
    Config,
}

impl FileKind {
    /// Classify a file by the extension of its original name.
    pub fn from_filename(filename: &str) -> Self {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "tif" | "tiff" | "heic" | "avif" => {
                FileKind::Image
            }
            "cr2" | "cr3" | "nef" | "arw" | "dng" | "raf" | "orf" | "rw2" | "pef" | "srw"
            | "raw" => FileKind::Raw,
            "mp4" | "mov" | "avi" | "mkv" | "webm" | "m4v" | "mts" => FileKind::Video,
            "xmp" | "xml" | "pp3" | "dop" => FileKind::Sidecar,
            _ => FileKind::Config,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl Model {
    /// True when the file belongs in a JPEG-only archive.
    pub fn is_jpeg(&self) -> bool {
        if self.mime_type.eq_ignore_ascii_case("image/jpeg") {
            return true;
        }
        let lower = self.original_name.to_lowercase();
        lower.ends_with(".jpg") || lower.ends_with(".jpeg")
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file_chunks::Entity")]
    FileChunks,
}

impl Related<super::file_chunks::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileChunks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
