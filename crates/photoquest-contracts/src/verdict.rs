use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::errors::VerificationError;

pub const FALLBACK_EXPLANATION: &str =
    "Automatic photo verification could not be completed for technical reasons.";
pub const FALLBACK_SUGGESTION: &str =
    "Please try again by re-uploading the photo in a few moments.";

/// Result of checking one photo against one challenge.
///
/// Only [`validate`] and [`Verdict::fail_closed`] construct a verdict, so a value of this type
/// always satisfies the schema: `confidence` is finite and within `[0, 1]` and `explanation` is
/// non-empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    is_valid: bool,
    confidence: f64,
    explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggested_improvements: Option<String>,
}

impl Verdict {
    /// Rejection returned whenever no well-formed verdict could be obtained.
    pub fn fail_closed() -> Self {
        Self {
            is_valid: false,
            confidence: 0.0,
            explanation: FALLBACK_EXPLANATION.to_string(),
            suggested_improvements: Some(FALLBACK_SUGGESTION.to_string()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn suggested_improvements(&self) -> Option<&str> {
        self.suggested_improvements.as_deref()
    }

    pub fn is_fallback(&self) -> bool {
        !self.is_valid && self.confidence == 0.0 && self.explanation == FALLBACK_EXPLANATION
    }

    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("isValid".to_string(), Value::Bool(self.is_valid));
        out.insert("confidence".to_string(), json!(self.confidence));
        out.insert(
            "explanation".to_string(),
            Value::String(self.explanation.clone()),
        );
        if let Some(suggestion) = &self.suggested_improvements {
            out.insert(
                "suggestedImprovements".to_string(),
                Value::String(suggestion.clone()),
            );
        }
        Value::Object(out)
    }
}

impl TryFrom<&Value> for Verdict {
    type Error = VerificationError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        validate(value)
    }
}

/// Checks a parsed model response against the verdict contract.
///
/// Nothing is coerced: a string `"true"`, a confidence of `1.2` or a blank explanation are all
/// rejected rather than repaired.
pub fn validate(candidate: &Value) -> Result<Verdict, VerificationError> {
    let Some(obj) = candidate.as_object() else {
        return Err(VerificationError::validation(format!(
            "expected a JSON object, got {}",
            json_type_name(candidate)
        )));
    };

    let is_valid = match obj.get("isValid") {
        Some(Value::Bool(value)) => *value,
        Some(other) => {
            return Err(VerificationError::validation(format!(
                "isValid must be a boolean, got {}",
                json_type_name(other)
            )))
        }
        None => return Err(VerificationError::validation("isValid is missing")),
    };

    let confidence = match obj.get("confidence") {
        Some(Value::Number(number)) => number.as_f64().ok_or_else(|| {
            VerificationError::validation("confidence is not representable as a float")
        })?,
        Some(other) => {
            return Err(VerificationError::validation(format!(
                "confidence must be a number, got {}",
                json_type_name(other)
            )))
        }
        None => return Err(VerificationError::validation("confidence is missing")),
    };
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(VerificationError::validation(format!(
            "confidence {confidence} is outside [0, 1]"
        )));
    }

    let explanation = match obj.get("explanation") {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(Value::String(_)) => {
            return Err(VerificationError::validation("explanation is empty"))
        }
        Some(other) => {
            return Err(VerificationError::validation(format!(
                "explanation must be a string, got {}",
                json_type_name(other)
            )))
        }
        None => return Err(VerificationError::validation("explanation is missing")),
    };

    // Models tend to emit an explicit null for optional fields.
    let suggested_improvements = match obj.get("suggestedImprovements") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => (!text.trim().is_empty()).then(|| text.clone()),
        Some(other) => {
            return Err(VerificationError::validation(format!(
                "suggestedImprovements must be a string, got {}",
                json_type_name(other)
            )))
        }
    };

    Ok(Verdict {
        is_valid,
        confidence,
        explanation,
        suggested_improvements,
    })
}

/// Response schema hint for providers that support constrained output.
///
/// Advisory only; responses are still run through [`validate`].
pub fn response_schema_hint() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "isValid": { "type": "BOOLEAN" },
            "confidence": { "type": "NUMBER" },
            "explanation": { "type": "STRING" },
            "suggestedImprovements": { "type": "STRING" },
        },
        "required": ["isValid", "confidence", "explanation"],
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{response_schema_hint, validate, Verdict, FALLBACK_EXPLANATION};
    use crate::errors::VerificationErrorKind;

    fn assert_rejected(candidate: Value) {
        let err = validate(&candidate).expect_err("candidate should be rejected");
        assert_eq!(
            err.kind(),
            VerificationErrorKind::Validation,
            "unexpected kind for {candidate}"
        );
    }

    #[test]
    fn accepts_well_formed_verdict() {
        let verdict = validate(&json!({
            "isValid": true,
            "confidence": 0.92,
            "explanation": "Shows the couple kissing.",
        }))
        .unwrap();
        assert!(verdict.is_valid());
        assert_eq!(verdict.confidence(), 0.92);
        assert_eq!(verdict.explanation(), "Shows the couple kissing.");
        assert_eq!(verdict.suggested_improvements(), None);
    }

    #[test]
    fn keeps_suggestion_and_accepts_range_bounds() {
        let low = validate(&json!({
            "isValid": false,
            "confidence": 0,
            "explanation": "No cake in frame.",
            "suggestedImprovements": "Step closer to the dessert table.",
        }))
        .unwrap();
        assert_eq!(low.confidence(), 0.0);
        assert_eq!(
            low.suggested_improvements(),
            Some("Step closer to the dessert table.")
        );

        let high = validate(&json!({
            "isValid": true,
            "confidence": 1,
            "explanation": "Perfect match.",
            "suggestedImprovements": null,
        }))
        .unwrap();
        assert_eq!(high.confidence(), 1.0);
        assert_eq!(high.suggested_improvements(), None);
    }

    #[test]
    fn keeps_strings_exactly_as_sent() {
        let verdict = validate(&json!({
            "isValid": false,
            "confidence": 0.2,
            "explanation": "  No rings visible.\n",
            "suggestedImprovements": " Zoom in on the hands. ",
        }))
        .unwrap();
        assert_eq!(verdict.explanation(), "  No rings visible.\n");
        assert_eq!(
            verdict.suggested_improvements(),
            Some(" Zoom in on the hands. ")
        );

        let blank = validate(&json!({
            "isValid": true,
            "confidence": 0.9,
            "explanation": "Rings exchanged.",
            "suggestedImprovements": "   ",
        }))
        .unwrap();
        assert_eq!(blank.suggested_improvements(), None);
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert_rejected(json!({"confidence": 0.5, "explanation": "x"}));
        assert_rejected(json!({"isValid": true, "explanation": "x"}));
        assert_rejected(json!({"isValid": true, "confidence": 0.5}));
        assert_rejected(json!({}));
    }

    #[test]
    fn rejects_out_of_range_confidence_without_clamping() {
        for confidence in [json!(-0.01), json!(1.01), json!(92), json!(-1)] {
            assert_rejected(json!({
                "isValid": true,
                "confidence": confidence,
                "explanation": "x",
            }));
        }
    }

    #[test]
    fn rejects_mistyped_fields() {
        assert_rejected(json!({"isValid": "true", "confidence": 0.5, "explanation": "x"}));
        assert_rejected(json!({"isValid": 1, "confidence": 0.5, "explanation": "x"}));
        assert_rejected(json!({"isValid": true, "confidence": "0.5", "explanation": "x"}));
        assert_rejected(json!({"isValid": true, "confidence": null, "explanation": "x"}));
        assert_rejected(json!({"isValid": true, "confidence": 0.5, "explanation": 7}));
        assert_rejected(json!({"isValid": true, "confidence": 0.5, "explanation": "   "}));
        assert_rejected(json!({
            "isValid": true,
            "confidence": 0.5,
            "explanation": "x",
            "suggestedImprovements": ["more light"],
        }));
    }

    #[test]
    fn rejects_non_objects() {
        assert_rejected(json!([{"isValid": true}]));
        assert_rejected(json!("isValid"));
        assert_rejected(Value::Null);
    }

    #[test]
    fn fail_closed_verdict_never_approves() {
        let verdict = Verdict::fail_closed();
        assert!(!verdict.is_valid());
        assert_eq!(verdict.confidence(), 0.0);
        assert_eq!(verdict.explanation(), FALLBACK_EXPLANATION);
        assert!(verdict
            .suggested_improvements()
            .unwrap_or_default()
            .contains("try again"));
        assert!(verdict.is_fallback());
    }

    #[test]
    fn serializes_with_camel_case_field_names() -> anyhow::Result<()> {
        let verdict = Verdict::fail_closed();
        let rendered = serde_json::to_value(&verdict)?;
        assert_eq!(rendered, verdict.to_value());
        assert_eq!(rendered["isValid"], json!(false));
        assert!(rendered.get("suggestedImprovements").is_some());

        let reparsed = Verdict::try_from(&rendered)?;
        assert_eq!(reparsed, verdict);
        Ok(())
    }

    #[test]
    fn schema_hint_requires_core_fields() {
        let hint = response_schema_hint();
        assert_eq!(
            hint["required"],
            json!(["isValid", "confidence", "explanation"])
        );
        assert!(hint["properties"].get("suggestedImprovements").is_some());
    }
}
