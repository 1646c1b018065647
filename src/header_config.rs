use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::casing::convert_keys_to_camel_case;
use crate::error::{GatewayError, Result};
use crate::target::Target;

pub const CONFIG_HEADER: &str = "x-portkey-config";
pub const PROVIDER_HEADER: &str = "x-portkey-provider";
pub const DEFAULT_INPUT_GUARDRAILS_HEADER: &str = "x-portkey-default-input-guardrails";
pub const DEFAULT_OUTPUT_GUARDRAILS_HEADER: &str = "x-portkey-default-output-guardrails";
pub const METADATA_HEADER: &str = "x-portkey-metadata";
pub const FILE_PURPOSE_HEADER: &str = "x-portkey-file-purpose";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    header_str(headers, name).map(str::to_string)
}

/// `authorization: Bearer sk-…` → `sk-…`.
pub fn strip_bearer(authorization: &str) -> String {
    authorization
        .strip_prefix("Bearer ")
        .unwrap_or(authorization)
        .to_string()
}

/// Parses a header carrying a JSON array, yielding an empty list on absence
/// or malformed content.
fn parse_json_array_header(headers: &HeaderMap, name: &str) -> Vec<Value> {
    header_str(headers, name)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default()
}

macro_rules! provider_params {
    ($name:ident { $($field:ident => $header:literal),+ $(,)? }) => {
        #[derive(Clone, Debug, Default, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<String>,
            )+
        }

        impl $name {
            pub fn from_headers(headers: &HeaderMap) -> Self {
                Self {
                    $($field: header_string(headers, $header),)+
                }
            }
        }
    };
}

provider_params!(AzureOpenAiParams {
    resource_name => "x-portkey-resource-name",
    deployment_id => "x-portkey-deployment-id",
    api_version => "x-portkey-api-version",
    azure_ad_token => "x-portkey-azure-ad-token",
    azure_auth_mode => "x-portkey-azure-auth-mode",
    azure_managed_client_id => "x-portkey-azure-managed-client-id",
    azure_entra_client_id => "x-portkey-azure-entra-client-id",
    azure_entra_client_secret => "x-portkey-azure-entra-client-secret",
    azure_entra_tenant_id => "x-portkey-azure-entra-tenant-id",
    azure_model_name => "x-portkey-azure-model-name",
    openai_beta => "x-portkey-openai-beta",
});

provider_params!(AwsBaseParams {
    aws_access_key_id => "x-portkey-aws-access-key-id",
    aws_secret_access_key => "x-portkey-aws-secret-access-key",
    aws_session_token => "x-portkey-aws-session-token",
    aws_region => "x-portkey-aws-region",
    aws_role_arn => "x-portkey-aws-role-arn",
    aws_auth_type => "x-portkey-aws-auth-type",
    aws_external_id => "x-portkey-aws-external-id",
    aws_s3_bucket => "x-portkey-aws-s3-bucket",
    aws_s3_object_key => "x-portkey-aws-s3-object-key",
    aws_bedrock_model => "x-portkey-aws-bedrock-model",
    aws_server_side_encryption => "x-portkey-aws-server-side-encryption",
});

/// The KMS key id spells its acronym in caps on the wire, which camelCase
/// renaming cannot produce.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsParams {
    #[serde(flatten)]
    pub base: AwsBaseParams,
    #[serde(
        default,
        rename = "awsServerSideEncryptionKMSKeyId",
        skip_serializing_if = "Option::is_none"
    )]
    pub aws_server_side_encryption_kms_key_id: Option<String>,
}

impl AwsParams {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            base: AwsBaseParams::from_headers(headers),
            aws_server_side_encryption_kms_key_id: header_string(
                headers,
                "x-portkey-aws-server-side-encryption-kms-key-id",
            ),
        }
    }
}

provider_params!(SagemakerParams {
    amzn_sagemaker_custom_attributes => "x-portkey-amzn-sagemaker-custom-attributes",
    amzn_sagemaker_target_model => "x-portkey-amzn-sagemaker-target-model",
    amzn_sagemaker_target_variant => "x-portkey-amzn-sagemaker-target-variant",
    amzn_sagemaker_target_container_hostname => "x-portkey-amzn-sagemaker-target-container-hostname",
    amzn_sagemaker_inference_id => "x-portkey-amzn-sagemaker-inference-id",
    amzn_sagemaker_enable_explanations => "x-portkey-amzn-sagemaker-enable-explanations",
    amzn_sagemaker_inference_component => "x-portkey-amzn-sagemaker-inference-component",
    amzn_sagemaker_session_id => "x-portkey-amzn-sagemaker-session-id",
    amzn_sagemaker_model_name => "x-portkey-amzn-sagemaker-model-name",
});

provider_params!(VertexAiStringParams {
    vertex_project_id => "x-portkey-vertex-project-id",
    vertex_region => "x-portkey-vertex-region",
    vertex_storage_bucket_name => "x-portkey-vertex-storage-bucket-name",
    filename => "x-portkey-filename",
    vertex_model_name => "x-portkey-vertex-model-name",
    vertex_batch_endpoint => "x-portkey-vertex-batch-endpoint",
});

/// Vertex carries one non-string field: the service-account JSON, parsed
/// eagerly and silently nulled when malformed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexAiParams {
    #[serde(flatten)]
    pub strings: VertexAiStringParams,
    #[serde(
        default,
        rename = "vertex_service_account_json",
        skip_serializing_if = "Option::is_none"
    )]
    pub vertex_service_account_json: Option<Value>,
}

impl VertexAiParams {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let vertex_service_account_json =
            header_str(headers, "x-portkey-vertex-service-account-json")
                .and_then(|raw| serde_json::from_str(raw).ok());
        Self {
            strings: VertexAiStringParams::from_headers(headers),
            vertex_service_account_json,
        }
    }
}

provider_params!(AzureAiInferenceParams {
    azure_api_version => "x-portkey-azure-api-version",
    azure_endpoint_name => "x-portkey-azure-endpoint-name",
    azure_foundry_url => "x-portkey-azure-foundry-url",
    azure_extra_params => "x-portkey-azure-extra-params",
});

provider_params!(OpenAiParams {
    openai_organization => "x-portkey-openai-organization",
    openai_project => "x-portkey-openai-project",
    openai_beta => "x-portkey-openai-beta",
});

provider_params!(AnthropicParams {
    anthropic_beta => "x-portkey-anthropic-beta",
    anthropic_version => "x-portkey-anthropic-version",
});

provider_params!(HuggingfaceParams {
    huggingface_base_url => "x-portkey-huggingface-base-url",
});

provider_params!(StabilityAiParams {
    stability_client_id => "x-portkey-stability-client-id",
    stability_client_user_id => "x-portkey-stability-client-user-id",
    stability_client_version => "x-portkey-stability-client-version",
});

provider_params!(FireworksAiParams {
    fireworks_account_id => "x-portkey-fireworks-account-id",
    fireworks_file_length => "x-portkey-fireworks-file-length",
});

provider_params!(WorkersAiParams {
    workers_ai_account_id => "x-portkey-workers-ai-account-id",
});

provider_params!(CortexParams {
    snowflake_account => "x-portkey-snowflake-account",
});

provider_params!(UnknownProviderParams {
    mistral_fim_completion => "x-portkey-mistral-fim-completion",
});

/// Provider-specific credential and routing fields, keyed by the `provider`
/// string a request names.
#[derive(Clone, Debug)]
pub enum ProviderParams {
    AzureOpenAi(AzureOpenAiParams),
    Bedrock(AwsParams),
    Sagemaker(AwsParams, SagemakerParams),
    VertexAi(VertexAiParams),
    AzureAiInference(AzureAiInferenceParams),
    OpenAi(OpenAiParams),
    Anthropic(AnthropicParams),
    Huggingface(HuggingfaceParams),
    StabilityAi(StabilityAiParams),
    FireworksAi(FireworksAiParams),
    WorkersAi(WorkersAiParams),
    Cortex(CortexParams),
    Other(UnknownProviderParams),
}

impl ProviderParams {
    pub fn from_headers(provider: &str, headers: &HeaderMap) -> Self {
        match provider {
            "azure-openai" => Self::AzureOpenAi(AzureOpenAiParams::from_headers(headers)),
            "bedrock" => Self::Bedrock(AwsParams::from_headers(headers)),
            "sagemaker" => Self::Sagemaker(
                AwsParams::from_headers(headers),
                SagemakerParams::from_headers(headers),
            ),
            "google-vertex-ai" => Self::VertexAi(VertexAiParams::from_headers(headers)),
            "azure-ai-inference" => {
                Self::AzureAiInference(AzureAiInferenceParams::from_headers(headers))
            }
            "openai" => Self::OpenAi(OpenAiParams::from_headers(headers)),
            "anthropic" => Self::Anthropic(AnthropicParams::from_headers(headers)),
            "huggingface" => Self::Huggingface(HuggingfaceParams::from_headers(headers)),
            "stability-ai" => Self::StabilityAi(StabilityAiParams::from_headers(headers)),
            "fireworks-ai" => Self::FireworksAi(FireworksAiParams::from_headers(headers)),
            "workers-ai" => Self::WorkersAi(WorkersAiParams::from_headers(headers)),
            "cortex" => Self::Cortex(CortexParams::from_headers(headers)),
            _ => Self::Other(UnknownProviderParams::from_headers(headers)),
        }
    }

    /// Flattens the typed params into the open map a `Target` carries.
    pub fn into_fields(self) -> Map<String, Value> {
        let value = match self {
            Self::AzureOpenAi(params) => serde_json::to_value(params),
            Self::Bedrock(params) => serde_json::to_value(params),
            Self::Sagemaker(aws, sagemaker) => {
                serde_json::to_value(aws).and_then(|mut merged| {
                    if let (Some(target), Ok(Value::Object(extra))) =
                        (merged.as_object_mut(), serde_json::to_value(sagemaker))
                    {
                        target.extend(extra);
                    }
                    Ok(merged)
                })
            }
            Self::VertexAi(params) => serde_json::to_value(params),
            Self::AzureAiInference(params) => serde_json::to_value(params),
            Self::OpenAi(params) => serde_json::to_value(params),
            Self::Anthropic(params) => serde_json::to_value(params),
            Self::Huggingface(params) => serde_json::to_value(params),
            Self::StabilityAi(params) => serde_json::to_value(params),
            Self::FireworksAi(params) => serde_json::to_value(params),
            Self::WorkersAi(params) => serde_json::to_value(params),
            Self::Cortex(params) => serde_json::to_value(params),
            Self::Other(params) => serde_json::to_value(params),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Derives the routing config for one request from its headers: either the
/// full JSON tree in `x-portkey-config`, or a flat single-provider target
/// assembled from the per-provider header family.
pub fn build_target_from_headers(headers: &HeaderMap) -> Result<Target> {
    let default_input_guardrails =
        parse_json_array_header(headers, DEFAULT_INPUT_GUARDRAILS_HEADER);
    let default_output_guardrails =
        parse_json_array_header(headers, DEFAULT_OUTPUT_GUARDRAILS_HEADER);

    let config = match header_str(headers, CONFIG_HEADER) {
        Some(raw) => {
            let parsed: Value = serde_json::from_str(raw).map_err(|err| {
                GatewayError::gateway(format!("Invalid {CONFIG_HEADER} header: {err}"))
            })?;
            let mut config = match parsed {
                Value::Object(map) => map,
                _ => {
                    return Err(GatewayError::gateway(format!(
                        "Invalid {CONFIG_HEADER} header: expected a JSON object"
                    )));
                }
            };

            if !default_input_guardrails.is_empty() {
                config.insert(
                    "default_input_guardrails".to_string(),
                    Value::Array(default_input_guardrails),
                );
            }
            if !default_output_guardrails.is_empty() {
                config.insert(
                    "default_output_guardrails".to_string(),
                    Value::Array(default_output_guardrails),
                );
            }

            // A config naming neither a provider nor targets is a bag of
            // params for the provider the flat headers name.
            if !config.contains_key("provider") && !config.contains_key("targets") {
                enrich_with_provider_headers(&mut config, headers);
            }

            convert_keys_to_camel_case(Value::Object(config))
        }
        None => {
            let mut config = Map::new();
            enrich_with_provider_headers(&mut config, headers);
            if !default_input_guardrails.is_empty() {
                config.insert(
                    "default_input_guardrails".to_string(),
                    Value::Array(default_input_guardrails),
                );
            }
            if !default_output_guardrails.is_empty() {
                config.insert(
                    "default_output_guardrails".to_string(),
                    Value::Array(default_output_guardrails),
                );
            }
            Value::Object(config)
        }
    };

    serde_json::from_value(config)
        .map_err(|err| GatewayError::gateway(format!("Invalid gateway config: {err}")))
}

fn enrich_with_provider_headers(config: &mut Map<String, Value>, headers: &HeaderMap) {
    let provider = header_string(headers, PROVIDER_HEADER).unwrap_or_default();
    if !provider.is_empty() {
        config
            .entry("provider".to_string())
            .or_insert_with(|| Value::String(provider.clone()));
    }
    if !config.contains_key("api_key") && !config.contains_key("apiKey") {
        if let Some(authorization) = header_str(headers, "authorization") {
            config.insert("apiKey".to_string(), json!(strip_bearer(authorization)));
        }
    }

    for (key, value) in ProviderParams::from_headers(&provider, headers).into_fields() {
        config.entry(key).or_insert(value);
    }
}
