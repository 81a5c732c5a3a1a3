use anyhow::Result;
use std::collections::HashMap;
use tonic::transport::Channel;

use crate::Error;

pub mod proto {
    tonic::include_proto!("camerahub.inference");
}

use proto::predictor_client::PredictorClient;
use proto::{PredictRequest, Tensor, TensorShape};

const MODEL_NAME: &str = "person-detection-retail-0013";
const MODEL_VERSION_LABEL: &str = "1";
const SIGNATURE_NAME: &str = "serving_default";
const INPUT_NAME: &str = "data";
const OUTPUT_NAME: &str = "detection_out";

/// A thin gRPC client for the remote inference server.
///
/// Delegated per spec to a generated client against a `Predict` RPC; the
/// wire contract itself (model name, signature, input/output tensor names)
/// is the part that is actually specified.
pub struct InferenceClient {
    client: PredictorClient<Channel>,
}

impl InferenceClient {
    pub async fn connect(grpc_addr: &str) -> Result<Self> {
        let client = PredictorClient::connect(grpc_addr.to_string())
            .await
            .map_err(|e| Error::Inference(format!("connect to {grpc_addr}: {e}")))?;
        Ok(Self { client })
    }

    /// Sends a batched `[N,C,H,W]` float32 tensor and returns the flat
    /// `detection_out` tensor, shape `[N,1,200,7]`.
    pub async fn predict(&mut self, data: Vec<f32>, shape: [i64; 4]) -> Result<Vec<f32>> {
        let mut inputs = HashMap::new();
        inputs.insert(
            INPUT_NAME.to_string(),
            Tensor {
                shape: Some(TensorShape {
                    dim: shape.to_vec(),
                }),
                data,
            },
        );

        let request = PredictRequest {
            model_name: MODEL_NAME.to_string(),
            model_version_label: MODEL_VERSION_LABEL.to_string(),
            signature_name: SIGNATURE_NAME.to_string(),
            inputs,
        };

        let response = self
            .client
            .predict(request)
            .await
            .map_err(|e| Error::Inference(format!("predict rpc: {e}")))?
            .into_inner();

        response
            .outputs
            .get(OUTPUT_NAME)
            .map(|t| t.data.clone())
            .ok_or_else(|| Error::Inference(format!("response missing output {OUTPUT_NAME}")).into())
    }
}
