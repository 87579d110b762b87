use crate::error::Result;
use crate::image::ImageName;
use serde::{Deserialize, Serialize};

/// ビルド後に付与するイメージ名の集合
///
/// - primary: `name:version-release` のような主要タグ
/// - unique: ビルドごとに一意なタグ
/// - floating: `latest` のように移動するタグ
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagConf {
    #[serde(default)]
    pub primary_images: Vec<ImageName>,
    #[serde(default)]
    pub unique_images: Vec<ImageName>,
    #[serde(default)]
    pub floating_images: Vec<ImageName>,
}

impl TagConf {
    pub fn add_primary_image(&mut self, image: &str) -> Result<()> {
        push_unique(&mut self.primary_images, ImageName::parse(image)?);
        Ok(())
    }

    pub fn add_unique_image(&mut self, image: &str) -> Result<()> {
        push_unique(&mut self.unique_images, ImageName::parse(image)?);
        Ok(())
    }

    pub fn add_floating_image(&mut self, image: &str) -> Result<()> {
        push_unique(&mut self.floating_images, ImageName::parse(image)?);
        Ok(())
    }

    /// 全イメージ（primary, unique, floating の順）
    pub fn images(&self) -> Vec<&ImageName> {
        self.primary_images
            .iter()
            .chain(&self.unique_images)
            .chain(&self.floating_images)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.primary_images.is_empty()
            && self.unique_images.is_empty()
            && self.floating_images.is_empty()
    }
}

fn push_unique(images: &mut Vec<ImageName>, image: ImageName) {
    if !images.contains(&image) {
        images.push(image);
    }
}
