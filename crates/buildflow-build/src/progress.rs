use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// ビルドコンテナのログを流しながら回るスピナー
pub struct BuildProgress {
    progress_bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(image: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("Building {}...", image));

        Self { progress_bar: pb }
    }

    /// 何も表示しない（テストや非対話環境向け）
    pub fn hidden() -> Self {
        Self {
            progress_bar: ProgressBar::hidden(),
        }
    }

    /// コンテナログの最新行を表示
    pub fn log_line(&self, line: &str) {
        let line = line.trim();
        if !line.is_empty() {
            self.progress_bar.set_message(line.to_string());
        }
    }

    pub fn finish_success(&self, image: &str) {
        self.progress_bar
            .finish_with_message(format!("{} {}", "✓".green(), image));
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("{} Build failed: {}", "✗".red(), error));
    }
}
