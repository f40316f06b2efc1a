use serde::{Deserialize, Serialize};

/// Probability above which an image is classified as tuberculosis.
///
/// The comparison is strict: exactly 0.5 is reported as normal.
pub const DECISION_THRESHOLD: f32 = 0.5;

/// Binary class label.
///
/// Indices are fixed here instead of being derived from directory order,
/// so a renamed or re-sorted dataset cannot swap the classes silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Tuberculosis,
}

impl Label {
    /// All labels in index order
    pub const ALL: [Label; 2] = [Label::Normal, Label::Tuberculosis];

    /// Target value used by the loss (0 = normal, 1 = tuberculosis)
    pub fn index(self) -> usize {
        match self {
            Label::Normal => 0,
            Label::Tuberculosis => 1,
        }
    }

    /// Name used for the class directory and in API responses
    pub fn name(self) -> &'static str {
        match self {
            Label::Normal => "normal",
            Label::Tuberculosis => "tuberculosis",
        }
    }

    /// Resolves a class directory name, ignoring ASCII case.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|label| label.name().eq_ignore_ascii_case(name))
    }

    pub fn from_probability(probability: f32) -> Self {
        if probability > DECISION_THRESHOLD {
            Label::Tuberculosis
        } else {
            Label::Normal
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of one forward pass, serialized as the `/predict` response body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub probability_tuberculosis: f32,
    pub class_name: Label,
}

impl Prediction {
    pub fn from_probability(probability: f32) -> Self {
        Self {
            probability_tuberculosis: probability,
            class_name: Label::from_probability(probability),
        }
    }
}
