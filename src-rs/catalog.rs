use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Which vendor API family serves a model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VendorEndpoint {
    /// `/api/v1/jobs/createTask` market models.
    Jobs,
    /// `/api/v1/veo/generate`.
    Veo,
}

#[derive(Clone, Copy, Debug)]
pub struct ModelSpec {
    pub id: &'static str,
    pub kind: MediaKind,
    pub endpoint: VendorEndpoint,
    pub vendor_model: &'static str,
    pub cost: i64,
    pub free_eligible: bool,
    pub requires_image: bool,
}

const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "nano-banana",
        kind: MediaKind::Image,
        endpoint: VendorEndpoint::Jobs,
        vendor_model: "google/nano-banana",
        cost: 4,
        free_eligible: true,
        requires_image: false,
    },
    ModelSpec {
        id: "nano-banana-edit",
        kind: MediaKind::Image,
        endpoint: VendorEndpoint::Jobs,
        vendor_model: "google/nano-banana-edit",
        cost: 4,
        free_eligible: true,
        requires_image: true,
    },
    ModelSpec {
        id: "seedream-v4",
        kind: MediaKind::Image,
        endpoint: VendorEndpoint::Jobs,
        vendor_model: "bytedance/seedream-v4-text-to-image",
        cost: 6,
        free_eligible: false,
        requires_image: false,
    },
    ModelSpec {
        id: "kling-v2-1",
        kind: MediaKind::Video,
        endpoint: VendorEndpoint::Jobs,
        vendor_model: "kling/v2-1-standard",
        cost: 40,
        free_eligible: false,
        requires_image: true,
    },
    ModelSpec {
        id: "veo3-fast",
        kind: MediaKind::Video,
        endpoint: VendorEndpoint::Veo,
        vendor_model: "veo3_fast",
        cost: 60,
        free_eligible: false,
        requires_image: false,
    },
    ModelSpec {
        id: "veo3",
        kind: MediaKind::Video,
        endpoint: VendorEndpoint::Veo,
        vendor_model: "veo3",
        cost: 250,
        free_eligible: false,
        requires_image: false,
    },
];

pub fn find_model(id: &str) -> Option<&'static ModelSpec> {
    let id = id.trim();
    MODELS.iter().find(|model| model.id.eq_ignore_ascii_case(id))
}

pub fn default_model(kind: MediaKind) -> &'static ModelSpec {
    match kind {
        MediaKind::Image => &MODELS[0],
        MediaKind::Video => &MODELS[4],
    }
}
