use crate::Evaluator;
use openshift_admission_core::{
    AdmissionResult, Attributes, Interface, Operation, ValidationInterface,
};

pub const PLUGIN_NAME: &str = "quota.openshift.io/ClusterResourceQuotaAdmission";

/// Validates namespaced creates and updates against cluster quotas.
pub struct ClusterQuotaAdmission {
    evaluator: Evaluator,
}

// === impl ClusterQuotaAdmission ===

impl ClusterQuotaAdmission {
    pub fn new(evaluator: Evaluator) -> Self {
        Self { evaluator }
    }
}

impl Interface for ClusterQuotaAdmission {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn handles(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }
}

#[async_trait::async_trait]
impl ValidationInterface for ClusterQuotaAdmission {
    async fn validate(&self, attributes: &Attributes) -> AdmissionResult {
        self.evaluator.evaluate(attributes).await
    }
}
