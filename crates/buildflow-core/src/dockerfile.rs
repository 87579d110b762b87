//! Dockerfile のステージ解析
//!
//! FROM / COPY --from からステージグラフと親イメージを抽出します。
//! ビルド命令そのものは解釈しません。

use crate::constants::{CUSTOM_BASE_IMAGE_PREFIX, SCRATCH};
use crate::error::{CoreError, Result};
use crate::image::ImageName;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// FROM 命令1つ分のビルドステージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerfileStage {
    pub index: usize,
    /// FROM に書かれたイメージ（ARG 展開済み）
    pub image: String,
    pub alias: Option<String>,
    pub platform: Option<String>,
    /// 前段ステージを参照している場合、そのインデックス
    pub parent_stage: Option<usize>,
}

/// Dockerfile 解析結果
#[derive(Debug, Clone, Default)]
pub struct ParsedDockerfile {
    pub stages: Vec<DockerfileStage>,
    /// 外部の親イメージ（出現順・重複なし）
    pub parent_images: Vec<String>,
    /// COPY --from で直接参照された外部イメージ
    pub copy_from_images: Vec<String>,
}

impl ParsedDockerfile {
    /// 最終ステージのベースイメージ（前段ステージ参照をたどった先）
    pub fn base_image(&self) -> Option<&str> {
        let mut stage = self.stages.last()?;
        while let Some(parent) = stage.parent_stage {
            stage = &self.stages[parent];
        }
        Some(stage.image.as_str())
    }

    pub fn dockerfile_images(&self) -> DockerfileImages {
        DockerfileImages::new(self.parent_images.iter().cloned(), self.base_image())
    }
}

/// Dockerfile ファイルを読み込んで解析
pub fn parse_dockerfile_path(path: &Path) -> Result<ParsedDockerfile> {
    if !path.is_file() {
        return Err(CoreError::DockerfileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_dockerfile(&content).map_err(|e| match e {
        CoreError::DockerfileNoFrom(_) => CoreError::DockerfileNoFrom(path.to_path_buf()),
        other => other,
    })
}

/// Dockerfile の内容を解析
pub fn parse_dockerfile(content: &str) -> Result<ParsedDockerfile> {
    let mut parsed = ParsedDockerfile::default();
    let mut args: HashMap<String, String> = HashMap::new();

    for (line_no, line) in logical_lines(content) {
        let mut words = line.split_whitespace();
        let Some(instruction) = words.next() else {
            continue;
        };
        let rest: Vec<&str> = words.collect();

        match instruction.to_ascii_uppercase().as_str() {
            "ARG" if parsed.stages.is_empty() => {
                // FROM より前の ARG だけが FROM の展開に使われる
                for decl in &rest {
                    match decl.split_once('=') {
                        Some((name, value)) => {
                            args.insert(name.to_string(), value.trim_matches('"').to_string())
                        }
                        None => args.insert(decl.to_string(), String::new()),
                    };
                }
            }
            "FROM" => parse_from(&mut parsed, &rest, &args, line_no)?,
            "COPY" => parse_copy(&mut parsed, &rest, line_no)?,
            _ if parsed.stages.is_empty() => {
                return Err(CoreError::DockerfileSyntax {
                    line: line_no,
                    message: format!("{} が FROM より前にあります", instruction),
                });
            }
            _ => {}
        }
    }

    if parsed.stages.is_empty() {
        return Err(CoreError::DockerfileNoFrom(Default::default()));
    }
    Ok(parsed)
}

fn parse_from(
    parsed: &mut ParsedDockerfile,
    tokens: &[&str],
    args: &HashMap<String, String>,
    line_no: usize,
) -> Result<()> {
    let mut platform = None;
    let mut positional = Vec::new();
    for token in tokens {
        if let Some(flag) = token.strip_prefix("--") {
            if let Some(value) = flag.strip_prefix("platform=") {
                platform = Some(value.to_string());
            }
        } else {
            positional.push(*token);
        }
    }

    let image = match positional.first() {
        Some(image) => expand_args(image, args),
        None => {
            return Err(CoreError::DockerfileSyntax {
                line: line_no,
                message: "FROM にイメージが指定されていません".to_string(),
            });
        }
    };
    let alias = match positional.as_slice() {
        [_, kw, alias] if kw.eq_ignore_ascii_case("as") => Some(alias.to_ascii_lowercase()),
        [_] => None,
        _ => {
            return Err(CoreError::DockerfileSyntax {
                line: line_no,
                message: format!("FROM の書式が不正です: {}", tokens.join(" ")),
            });
        }
    };

    let parent_stage = find_stage(&parsed.stages, &image);
    if parent_stage.is_none() && !parsed.parent_images.contains(&image) {
        parsed.parent_images.push(image.clone());
    }

    parsed.stages.push(DockerfileStage {
        index: parsed.stages.len(),
        image,
        alias,
        platform,
        parent_stage,
    });
    Ok(())
}

fn parse_copy(parsed: &mut ParsedDockerfile, tokens: &[&str], line_no: usize) -> Result<()> {
    let current = match parsed.stages.last() {
        Some(stage) => stage.index,
        None => {
            return Err(CoreError::DockerfileSyntax {
                line: line_no,
                message: "COPY が FROM より前にあります".to_string(),
            });
        }
    };

    let Some(reference) = tokens.iter().find_map(|t| t.strip_prefix("--from=")) else {
        return Ok(());
    };

    if let Ok(index) = reference.parse::<usize>() {
        if index >= current {
            return Err(CoreError::UnknownStage {
                reference: reference.to_string(),
                stage: current,
            });
        }
        return Ok(());
    }

    // 現在のステージ自身は参照できない
    let earlier = &parsed.stages[..current];
    if find_stage(earlier, reference).is_some() {
        return Ok(());
    }

    // FROM で使われたイメージ名はそのまま参照できる
    if parsed.parent_images.iter().any(|i| i == reference) || parsed.stages.iter().any(|s| s.image == reference) {
        return Ok(());
    }

    if looks_like_image(reference) {
        if !parsed.copy_from_images.iter().any(|i| i == reference) {
            parsed.copy_from_images.push(reference.to_string());
        }
        return Ok(());
    }

    Err(CoreError::UnknownStage {
        reference: reference.to_string(),
        stage: current,
    })
}

fn find_stage(stages: &[DockerfileStage], name: &str) -> Option<usize> {
    stages
        .iter()
        .rev()
        .find(|s| s.alias.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(name)))
        .map(|s| s.index)
}

fn looks_like_image(reference: &str) -> bool {
    reference.contains(['/', ':', '.', '@'])
}

/// `$VAR` / `${VAR}` を ARG の既定値で展開（未定義はそのまま残す）
fn expand_args(value: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let start = chars.peek().map(|(j, _)| *j).unwrap_or(value.len());
        let mut end = start;
        while let Some((j, ch)) = chars.peek().copied() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                end = j + ch.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let name = &value[start..end];
        if braced && matches!(chars.peek(), Some((_, '}'))) {
            chars.next();
        }
        match args.get(name) {
            Some(v) if !name.is_empty() => out.push_str(v),
            _ => {
                let raw_end = chars.peek().map(|(j, _)| *j).unwrap_or(value.len());
                out.push_str(&value[i..raw_end]);
            }
        }
    }
    out
}

/// 継続行を結合し、コメントと空行を除いた論理行を返す
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') || (trimmed.is_empty() && !current.is_empty()) {
            continue;
        }
        if current.is_empty() {
            start = idx + 1;
        }
        match trimmed.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(trimmed);
                if !current.trim().is_empty() {
                    lines.push((start, current.trim().to_string()));
                }
                current.clear();
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push((start, current.trim().to_string()));
    }
    lines
}

/// 親イメージの元の名前と、解決後の名前の対応表
///
/// 挿入順を保持します。`scratch` とカスタムベースイメージは
/// プレースホルダとして扱い、解決対象にしません。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerfileImages {
    entries: IndexMap<String, Option<ImageName>>,
    base_image: Option<String>,
}

impl DockerfileImages {
    pub fn new<I>(parents: I, base_image: Option<&str>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = IndexMap::new();
        for parent in parents {
            entries.entry(parent).or_insert(None);
        }
        Self {
            entries,
            base_image: base_image.map(str::to_string),
        }
    }

    pub fn is_placeholder(image: &str) -> bool {
        image == SCRATCH || image.starts_with(CUSTOM_BASE_IMAGE_PREFIX)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 元の親イメージ名（出現順）
    pub fn original_parents(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn base_image(&self) -> Option<&str> {
        self.base_image.as_deref()
    }

    pub fn base_from_scratch(&self) -> bool {
        self.base_image.as_deref() == Some(SCRATCH)
    }

    pub fn custom_base_image(&self) -> bool {
        self.base_image
            .as_deref()
            .is_some_and(|b| b.starts_with(CUSTOM_BASE_IMAGE_PREFIX))
    }

    pub fn resolved(&self, original: &str) -> Option<&ImageName> {
        self.entries.get(original).and_then(Option::as_ref)
    }

    /// 解決済みの親イメージを記録
    pub fn set_resolved(&mut self, original: &str, resolved: ImageName) -> Result<()> {
        if Self::is_placeholder(original) {
            return Err(CoreError::UnknownParentImage(original.to_string()));
        }
        match self.entries.get_mut(original) {
            Some(slot) => {
                *slot = Some(resolved);
                Ok(())
            }
            None => Err(CoreError::UnknownParentImage(original.to_string())),
        }
    }

    /// 未解決の親イメージ（プレースホルダを除く）
    pub fn unresolved(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, v)| v.is_none() && !Self::is_placeholder(k))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// 未解決の親イメージを元の名前で埋める
    pub fn fill_unresolved_with_originals(&mut self) -> Result<Vec<String>> {
        let pending: Vec<String> = self.unresolved().into_iter().map(str::to_string).collect();
        for original in &pending {
            let image = ImageName::parse(original)?;
            self.set_resolved(original, image)?;
        }
        Ok(pending)
    }

    /// (元の名前, 解決後の名前) の組
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&ImageName>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}
