use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Hardware,
    Software,
}

/// One selectable encoder pipeline. `script` is resolved against the
/// configured scripts directory at launch time.
#[derive(Debug, Clone, Serialize)]
pub struct StreamProfile {
    #[serde(skip)]
    pub id: &'static str,
    pub name: &'static str,
    pub script: &'static str,
    #[serde(rename = "type")]
    pub category: Category,
    pub codec: &'static str,
    pub recommended: bool,
}

pub static PROFILES: &[StreamProfile] = &[
    StreamProfile {
        id: "av1-nvenc",
        name: "AV1 (NVENC - RTX 40-series)",
        script: "stream-av1-nvenc.sh",
        category: Category::Hardware,
        codec: "AV1",
        recommended: false,
    },
    StreamProfile {
        id: "av1-vaapi",
        name: "AV1 (VA-API - Intel Arc/AMD RDNA3)",
        script: "stream-av1-vaapi.sh",
        category: Category::Hardware,
        codec: "AV1",
        recommended: false,
    },
    StreamProfile {
        id: "av1-svt",
        name: "AV1 (SVT-AV1 - Software)",
        script: "stream-av1-svt.sh",
        category: Category::Software,
        codec: "AV1",
        recommended: false,
    },
    StreamProfile {
        id: "av1-optiplex",
        name: "AV1 (OptiPlex - 1440p→720p)",
        script: "stream-av1-optiplex.sh",
        category: Category::Software,
        codec: "AV1",
        recommended: false,
    },
    StreamProfile {
        id: "vp9",
        name: "VP9 (OptiPlex Default - 1440p→720p)",
        script: "stream-vp9.sh",
        category: Category::Software,
        codec: "VP9",
        recommended: true,
    },
    StreamProfile {
        id: "av1-rav1e",
        name: "AV1 (RAV1E - Software)",
        script: "stream-av1.sh",
        category: Category::Software,
        codec: "AV1",
        recommended: false,
    },
    StreamProfile {
        id: "downscale-av1",
        name: "AV1 (1440p@144Hz → 1080p@60Hz)",
        script: "stream-1080p-downscale.sh",
        category: Category::Software,
        codec: "AV1",
        recommended: false,
    },
    StreamProfile {
        id: "h264-vaapi",
        name: "H.264 (VA-API - Intel/AMD)",
        script: "stream.sh",
        category: Category::Hardware,
        codec: "H.264",
        recommended: false,
    },
    StreamProfile {
        id: "h264-nvenc",
        name: "H.264 (NVENC - NVIDIA)",
        script: "stream-nvenc.sh",
        category: Category::Hardware,
        codec: "H.264",
        recommended: false,
    },
];

pub fn lookup(id: &str) -> Option<&'static StreamProfile> {
    PROFILES.iter().find(|p| p.id == id)
}

/// Catalog keyed by profile id, in the shape the page and `/api/scripts` expect.
pub fn by_id() -> BTreeMap<&'static str, &'static StreamProfile> {
    PROFILES.iter().map(|p| (p.id, p)).collect()
}

/// Reports whether each profile's launch script is present. A failed check
/// marks only that entry unavailable.
pub fn availability(scripts_dir: &Path) -> BTreeMap<&'static str, bool> {
    PROFILES
        .iter()
        .map(|p| {
            let available = match std::fs::metadata(scripts_dir.join(p.script)) {
                Ok(meta) => meta.is_file(),
                Err(err) => {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!(profile = p.id, error = %err, "script check failed");
                    }
                    false
                }
            };
            (p.id, available)
        })
        .collect()
}
