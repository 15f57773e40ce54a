use crate::job::AnalysisRequest;
use crate::queue::QueueName;
use crate::sr::SrProviderKind;

/// Picks the queue a job runs on. Only local model inference needs an
/// accelerator; everything else shares the CPU pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobRouter {
    provider: Option<SrProviderKind>,
}

impl JobRouter {
    pub fn new(provider: Option<SrProviderKind>) -> Self {
        Self { provider }
    }

    pub fn route(&self, request: &AnalysisRequest) -> QueueName {
        match (request.include_sr, self.provider) {
            (true, Some(SrProviderKind::LocalModel)) => QueueName::SrGpu,
            _ => QueueName::AnalysisCpu,
        }
    }
}
