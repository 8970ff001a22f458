use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

use crate::form::{ImageUpload, UploadSlot};
use crate::generate::ImageDataUri;
use crate::prompts::Language;
use crate::session::GeneratedImage;

pub const PROMPT_FILE: &str = "prompt.txt";

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        _ => return None,
    };
    Some(mime)
}

/// Reads a picked file into memory; type checks happen when it is placed on
/// the form.
pub async fn read_upload(path: &Path, slot: UploadSlot) -> Result<ImageUpload> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("not a file path: {}", path.display()))?;
    let mime = mime_for_path(path).ok_or_else(|| anyhow!("unrecognised image type: {}", path.display()))?;
    let bytes = fs::read(path).await.with_context(|| format!("Failed to read {:?} image {}", slot, path.display()))?;
    Ok(ImageUpload::new(name, mime, bytes))
}

/// `ai_<product base name>.png`, or `ai_ad.png` when there is no usable name.
pub fn download_name(product_file: Option<&str>) -> String {
    let base = product_file.and_then(|n| n.split('.').next()).filter(|b| !b.is_empty()).unwrap_or("ad");
    format!("ai_{base}.png")
}

/// Model output as PNG bytes; other formats are re-encoded.
pub fn to_png(uri: &ImageDataUri) -> Result<Vec<u8>> {
    let bytes = uri.decode().context("generated image is not valid base64")?;
    if uri.mime_type == "image/png" {
        return Ok(bytes);
    }
    let img = image::load_from_memory(&bytes).context("failed to decode generated image")?;
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(png)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        let _ = f.sync_all().await; // best-effort
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn save_prompt(out_dir: &Path, prompt: &str) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).await?;
    let path = out_dir.join(PROMPT_FILE);
    write_atomic(&path, prompt.as_bytes()).await?;
    Ok(path)
}

#[derive(Serialize)]
struct Sidecar<'a> {
    file: &'a str,
    prompt: &'a str,
    provider: &'a str,
    model: &'a str,
    product_file: &'a str,
    category: &'a str,
    template_id: u32,
    lang: Language,
    ratio: &'a str,
    source_mime_type: &'a str,
    created_at: String,
}

/// Writes `ai_<base>.png` and its `.json` sidecar; returns the image path.
pub async fn save_output(out_dir: &Path, img: &GeneratedImage, provider: &str, model: &str) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).await?;

    let file = download_name(Some(&img.product_file));
    let png = out_dir.join(&file);
    write_atomic(&png, &to_png(&img.uri)?).await?;

    let sidecar = Sidecar {
        file: &file,
        prompt: &img.prompt,
        provider,
        model,
        product_file: &img.product_file,
        category: &img.category,
        template_id: img.template_id,
        lang: img.lang,
        ratio: &img.ratio_id,
        source_mime_type: &img.uri.mime_type,
        created_at: img.created_at.to_rfc3339(),
    };
    write_atomic(&png.with_extension("json"), &serde_json::to_vec_pretty(&sidecar)?).await?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::Utc;

    fn encoded(fmt: image::ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), fmt).unwrap();
        out
    }

    fn generated(mime: &str, bytes: &[u8]) -> GeneratedImage {
        GeneratedImage {
            uri: ImageDataUri { mime_type: mime.into(), data: STANDARD.encode(bytes) },
            prompt: "Feature Wallet".into(),
            product_file: "wallet.front.jpg".into(),
            category: "Fashion".into(),
            template_id: 1,
            lang: Language::En,
            ratio_id: "1:1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn download_names() {
        assert_eq!(download_name(Some("wallet.front.jpg")), "ai_wallet.png");
        assert_eq!(download_name(Some(".jpg")), "ai_ad.png");
        assert_eq!(download_name(None), "ai_ad.png");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for_path(Path::new("a/b/Logo.SVG")), Some("image/svg+xml"));
        assert_eq!(mime_for_path(Path::new("shot.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("notes.txt")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }

    #[test]
    fn jpeg_output_is_reencoded_as_png() {
        let uri = ImageDataUri { mime_type: "image/jpeg".into(), data: STANDARD.encode(encoded(image::ImageFormat::Jpeg)) };
        let png = to_png(&uri).unwrap();
        assert_eq!(image::guess_format(&png).unwrap(), image::ImageFormat::Png);
    }

    #[tokio::test]
    async fn saves_image_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let img = generated("image/png", &encoded(image::ImageFormat::Png));
        let path = save_output(dir.path(), &img, "mock", "mock").await.unwrap();
        assert_eq!(path.file_name().unwrap(), "ai_wallet.png");
        assert!(!dir.path().join("ai_wallet.png.tmp").exists());

        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("ai_wallet.json")).unwrap()).unwrap();
        assert_eq!(sidecar["prompt"], "Feature Wallet");
        assert_eq!(sidecar["lang"], "en");
        assert_eq!(sidecar["template_id"], 1);
    }

    #[tokio::test]
    async fn saves_prompt_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_prompt(&dir.path().join("nested"), "Feature Wallet at ").await.unwrap();
        assert_eq!(path.file_name().unwrap(), PROMPT_FILE);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "Feature Wallet at ");
    }

    #[tokio::test]
    async fn reads_upload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("bag.webp");
        std::fs::write(&p, b"RIFF").unwrap();
        let up = read_upload(&p, UploadSlot::Logo).await.unwrap();
        assert_eq!(up.name, "bag.webp");
        assert_eq!(up.mime_type, "image/webp");
        assert!(read_upload(&dir.path().join("x.txt"), UploadSlot::Product).await.is_err());
    }
}
