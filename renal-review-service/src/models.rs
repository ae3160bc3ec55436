use clinical_core::{CkdStage, ClinicalData, TermExpansion};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpandTermsRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpandTermsResponse {
    pub text: String,
    pub expansions: Vec<TermExpansion>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeDocumentRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeDocumentResponse {
    pub document_id: String,
    pub expansions: Vec<TermExpansion>,
    pub clinical_data: ClinicalData,
    /// CKD stage looked up from the knowledge base when a GFR was extracted
    pub ckd_stage: Option<CkdStage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub clinical_data: ClinicalData,
    pub text: String,
}
