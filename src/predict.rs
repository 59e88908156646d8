use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ServiceError};
use crate::model::{Classifier, ImageTensor};
use crate::preprocess::preprocess_image;

pub const UNKNOWN_LABEL: &str = "Unknown";

const DEFAULT_LABELS: [&str; 3] = ["Capacitor", "Resistor", "Transistor"];

/// Class index to human readable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels(Vec<String>);

impl Default for Labels {
    fn default() -> Self {
        Labels(DEFAULT_LABELS.iter().map(|l| l.to_string()).collect())
    }
}

impl Labels {
    pub fn new(labels: Vec<String>) -> Self {
        Labels(labels)
    }

    /// Reads a class list with one label per line; blank lines are ignored
    /// and every label must be unique.
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let labels: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        if labels.is_empty() {
            return Err(ModelError::NoLabels(path.display().to_string()));
        }

        let mut seen = HashSet::new();
        if let Some(label) = labels.iter().find(|l| !seen.insert(l.as_str())) {
            return Err(ModelError::DuplicateLabel {
                path: path.display().to_string(),
                label: label.clone(),
            });
        }
        Ok(Labels::new(labels))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// Never fails: indices without a label map to `Unknown`.
    pub fn label_for(&self, index: usize) -> &str {
        self.get(index).unwrap_or(UNKNOWN_LABEL)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: String,
    pub confidence: f32,
    pub other_confidences: BTreeMap<String, f32>,
}

/// Index of the highest score; the first one wins on ties.
fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((i, score)),
        })
        .map(|(i, _)| i)
}

pub struct Predictor {
    classifier: Box<dyn Classifier>,
    labels: Labels,
}

impl Predictor {
    pub fn new(classifier: Box<dyn Classifier>, labels: Labels) -> Self {
        Predictor { classifier, labels }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn predict(&self, tensor: &ImageTensor) -> Result<Prediction, ModelError> {
        let scores = self.classifier.classify(tensor)?;
        if let Some(index) = scores.iter().position(|s| s.is_nan()) {
            return Err(ModelError::NanScore(index));
        }
        let predicted = argmax(&scores).ok_or(ModelError::EmptyOutput)?;

        let mut other_confidences = BTreeMap::new();
        for (i, &score) in scores.iter().enumerate() {
            if i == predicted {
                continue;
            }
            match self.labels.get(i) {
                Some(label) => {
                    other_confidences.insert(label.to_string(), score);
                }
                None => tracing::warn!(index = i, "model produced a class without a label"),
            }
        }

        Ok(Prediction {
            prediction: self.labels.label_for(predicted).to_string(),
            confidence: scores[predicted],
            other_confidences,
        })
    }

    /// Full pipeline for one upload: decode, normalize, classify.
    pub fn predict_image(&self, image_data: &[u8]) -> Result<Prediction, ServiceError> {
        let started = Instant::now();

        let tensor = preprocess_image(image_data)?;
        let prediction = self.predict(&tensor)?;

        tracing::debug!(
            label = %prediction.prediction,
            confidence = prediction.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "image classified"
        );
        Ok(prediction)
    }
}
