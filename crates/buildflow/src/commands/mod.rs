pub mod build;
pub mod inside_build;

use buildflow_core::BuildResult;
use colored::Colorize;

/// ビルド結果を表示し、失敗ならエラーにする
pub fn report(result: &BuildResult) -> anyhow::Result<()> {
    if let Some(reason) = result.fail_reason() {
        anyhow::bail!("ビルドに失敗しました: {}", reason);
    }
    if result.is_remote() {
        println!("{} リモートでビルドしました", "✓".green());
    } else if let Some(id) = result.image_id() {
        println!("{} ビルドしたイメージ: {}", "✓".green(), id.cyan());
    }
    Ok(())
}
