//! ビルドコンテナとのやり取りで使う固定値

/// ビルドコンテナに渡すビルド設定ファイル名
pub const BUILD_JSON: &str = "build.json";
/// ビルド設定を直接渡す環境変数名
pub const BUILD_JSON_ENV: &str = "BUILD_JSON";
/// ビルド結果ファイル名
pub const RESULTS_JSON: &str = "results.json";

/// ビルドコンテナ内の共有ディレクトリ
pub const CONTAINER_SHARE_PATH: &str = "/run/share/";
/// 共有ディレクトリ内でローカルソースを置くサブディレクトリ
pub const CONTAINER_SHARE_SOURCE_SUBDIR: &str = "source";
/// ビルドコンテナ内の build.json の既定パス
pub const CONTAINER_BUILD_JSON_PATH: &str = "/run/share/build.json";
/// ビルドコンテナに結果を書き出すディレクトリ
pub const CONTAINER_RESULTS_JSON_PATH: &str = "/run/share/results.json";

pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";
pub const DOCKERFILE_FILENAME: &str = "Dockerfile";

/// プラグイン引数中で展開される特殊値
pub const BUILT_IMAGE_ID: &str = "BUILT_IMAGE_ID";
pub const BUILD_DOCKERFILE_PATH: &str = "BUILD_DOCKERFILE_PATH";
pub const BUILD_SOURCE_PATH: &str = "BUILD_SOURCE_PATH";

/// ベースイメージを持たないビルドを表す疑似イメージ
pub const SCRATCH: &str = "scratch";
/// カスタムベースイメージのプレースホルダ接頭辞
pub const CUSTOM_BASE_IMAGE_PREFIX: &str = "koji/image-build";

/// ビルド結果がリモートで作られたことを示す番兵値
pub const REMOTE_IMAGE: &str = "__remote_image__";

/// ソース取得のリトライ回数
pub const GIT_MAX_RETRIES: u32 = 3;
/// ソース取得のリトライ間隔の基数（ミリ秒）
pub const GIT_BACKOFF_FACTOR_MS: u64 = 5_000;
