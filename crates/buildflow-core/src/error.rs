use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("無効なビルド設定: {0}")]
    InvalidConfig(String),

    #[error("無効なイメージ名: '{0}'")]
    InvalidImageName(String),

    #[error("Dockerfile が見つかりません: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Dockerfile に FROM 命令がありません: {0}")]
    DockerfileNoFrom(PathBuf),

    #[error("Dockerfile 構文エラー (行 {line}): {message}")]
    DockerfileSyntax { line: usize, message: String },

    #[error("ステージ {stage} の COPY --from={reference} は未定義のビルドステージを参照しています")]
    UnknownStage { reference: String, stage: usize },

    #[error("親イメージが不明、または未解決です: {0}")]
    UnknownParentImage(String),

    #[error("ソース取得エラー: {uri}\n理由: {message}")]
    Source { uri: String, message: String },

    #[error("無効なビルド結果: {0}")]
    InvalidBuildResult(String),

    #[error("置換 '{key}' を適用できません: {reason}")]
    Substitution { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
