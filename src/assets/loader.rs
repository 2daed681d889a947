//! Asset loader trait and the built-in loaders.

use super::{Asset, AssetError, AssetErrorInfo};

/// Context handed to a loader's decode
pub struct LoadContext<'a> {
    pub path: &'a str,
    pub bytes: &'a [u8],
}

/// Decodes raw bytes into assets of type `T`.
///
/// One loader per asset type, registered on the server. `size_of`
/// feeds the GC budget accounting; `unload` is the teardown hook.
pub trait AssetLoader<T: Asset>: Send + Sync {
    fn load(&self, context: LoadContext) -> Result<T, AssetErrorInfo>;

    /// Approximate memory footprint of a loaded asset
    fn size_of(&self, asset: &T) -> usize {
        std::mem::size_of_val(asset)
    }

    /// Teardown hook; the default just drops the asset
    fn unload(&self, asset: T) {
        drop(asset);
    }
}

/// Raw binary blob asset
#[derive(Clone, Debug)]
pub struct BytesAsset {
    pub data: Vec<u8>,
    pub path: String,
}

pub struct BytesLoader;

impl AssetLoader<BytesAsset> for BytesLoader {
    fn load(&self, context: LoadContext) -> Result<BytesAsset, AssetErrorInfo> {
        Ok(BytesAsset {
            data: context.bytes.to_vec(),
            path: context.path.to_string(),
        })
    }

    fn size_of(&self, asset: &BytesAsset) -> usize {
        std::mem::size_of::<BytesAsset>() + asset.data.len() + asset.path.len()
    }
}

/// UTF-8 text asset
#[derive(Clone, Debug)]
pub struct TextAsset {
    pub content: String,
    pub path: String,
}

pub struct TextLoader;

impl AssetLoader<TextAsset> for TextLoader {
    fn load(&self, context: LoadContext) -> Result<TextAsset, AssetErrorInfo> {
        let content = String::from_utf8(context.bytes.to_vec()).map_err(|e| {
            AssetErrorInfo::with_message(AssetError::DecodeFailed, &e.to_string())
        })?;
        Ok(TextAsset {
            content,
            path: context.path.to_string(),
        })
    }

    fn size_of(&self, asset: &TextAsset) -> usize {
        std::mem::size_of::<TextAsset>() + asset.content.len() + asset.path.len()
    }
}

/// Parsed JSON document asset
#[derive(Clone, Debug)]
pub struct JsonAsset {
    pub value: serde_json::Value,
    pub path: String,
}

pub struct JsonLoader;

impl AssetLoader<JsonAsset> for JsonLoader {
    fn load(&self, context: LoadContext) -> Result<JsonAsset, AssetErrorInfo> {
        let value: serde_json::Value = serde_json::from_slice(context.bytes).map_err(|e| {
            AssetErrorInfo::with_message(AssetError::DecodeFailed, &e.to_string())
        })?;
        Ok(JsonAsset {
            value,
            path: context.path.to_string(),
        })
    }
}
