use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("見つかりません: {0}")]
    NotFound(String),

    #[error("コンテナエンジン APIエラー (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error(
        "コンテナエンジンに接続できません: {0}\n\nヒント:\n  • Dockerが起動しているか確認してください\n  • DOCKER_HOST の設定を確認してください"
    )]
    Connection(String),

    /// ストリーム中の `{"error": ...}` 行
    #[error("コマンドが失敗しました: {0}")]
    CommandFailed(String),

    #[error("{operation}({args}) が {attempts} 回の試行後も失敗しました: {source}")]
    RetryExhausted {
        operation: String,
        args: String,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("認証情報エラー: {registry}\n理由: {message}")]
    Auth { registry: String, message: String },

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::NotFound(_) => true,
            EngineError::RetryExhausted { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// HTTP ステータス（API エラーの場合）
    pub fn status(&self) -> Option<u16> {
        match self {
            EngineError::Api { status, .. } => Some(*status),
            EngineError::NotFound(_) => Some(404),
            EngineError::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// 4xx のクライアントエラー
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            bollard::errors::Error::DockerStreamError { error } => EngineError::CommandFailed(error),
            other => EngineError::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
