use std::path::Path;
use std::time::Instant;

use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};

use crate::error::ModelError;

/// Height, width and channels of the image the model was trained on.
pub const IMAGE_DIMENSIONS: (u64, u64, u64) = (224, 224, 3);

/// A single preprocessed image with a leading batch axis, laid out NHWC.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    values: Vec<f32>,
}

impl ImageTensor {
    pub const SHAPE: [u64; 4] = [1, IMAGE_DIMENSIONS.0, IMAGE_DIMENSIONS.1, IMAGE_DIMENSIONS.2];

    pub const LEN: usize =
        (IMAGE_DIMENSIONS.0 * IMAGE_DIMENSIONS.1 * IMAGE_DIMENSIONS.2) as usize;

    pub fn new(values: Vec<f32>) -> Result<Self, ModelError> {
        if values.len() != Self::LEN {
            return Err(ModelError::InputSize {
                expected: Self::LEN,
                actual: values.len(),
            });
        }
        Ok(ImageTensor { values })
    }

    pub fn shape(&self) -> [u64; 4] {
        Self::SHAPE
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Anything that turns an image tensor into one probability per class.
pub trait Classifier: Send + Sync {
    fn classify(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError>;
}

/// Frozen TensorFlow graph loaded once at startup.
pub struct Model {
    session: Session,
    graph: Graph,
    input_op: String,
    output_op: String,
}

impl Model {
    pub fn new(model_path: &Path, input_op: &str, output_op: &str) -> Result<Self, ModelError> {
        let started = Instant::now();

        let model_bytes = std::fs::read(model_path).map_err(|source| ModelError::Io {
            path: model_path.display().to_string(),
            source,
        })?;

        let mut graph = Graph::new();
        graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;

        // Fail at startup rather than on the first request.
        for name in [input_op, output_op] {
            if graph.operation_by_name(name)?.is_none() {
                return Err(ModelError::MissingOperation(name.to_string()));
            }
        }

        let session = Session::new(&SessionOptions::new(), &graph)?;

        tracing::info!(
            path = %model_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(Model {
            session,
            graph,
            input_op: input_op.to_string(),
            output_op: output_op.to_string(),
        })
    }
}

impl Classifier for Model {
    fn classify(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
        let input_tensor = Tensor::new(&input.shape()).with_values(input.values())?;

        let input_operation = self
            .graph
            .operation_by_name(&self.input_op)?
            .ok_or_else(|| ModelError::MissingOperation(self.input_op.clone()))?;
        let output_operation = self
            .graph
            .operation_by_name(&self.output_op)?
            .ok_or_else(|| ModelError::MissingOperation(self.output_op.clone()))?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.session.run(&mut args)?;
        let output_tensor: Tensor<f32> = args.fetch(output_token)?;

        // Output is (1, classes); keep the single row.
        let classes = output_tensor.dims().last().copied().unwrap_or(0) as usize;
        select_row(&output_tensor, classes)
    }
}

/// First `classes` scores of the output, or an error for a degenerate shape.
fn select_row(output: &[f32], classes: usize) -> Result<Vec<f32>, ModelError> {
    if classes == 0 {
        return Err(ModelError::EmptyOutput);
    }
    output
        .get(..classes)
        .map(<[f32]>::to_vec)
        .ok_or(ModelError::EmptyOutput)
}
