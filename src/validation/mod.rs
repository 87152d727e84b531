use bigdecimal::BigDecimal;
use std::fmt;

pub const ETH_ADDRESS_HEX_LEN: usize = 40;
pub const TX_HASH_HEX_LEN: usize = 64;
pub const REMARK_MAX_LEN: usize = 255;
pub const NONCE_MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

fn validate_prefixed_hex(field: &'static str, value: &str, hex_len: usize) -> ValidationResult {
    let Some(hex_part) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) else {
        return Err(ValidationError::new(field, "must start with '0x'"));
    };

    if hex_part.len() != hex_len {
        return Err(ValidationError::new(
            field,
            format!("must contain exactly {} hex characters", hex_len),
        ));
    }

    if !hex_part.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(ValidationError::new(field, "must be hexadecimal"));
    }

    Ok(())
}

/// Validates an EVM address and returns its lowercase form, which is how
/// addresses are stored and compared.
pub fn normalize_address(address: &str) -> Result<String, ValidationError> {
    let address = sanitize_string(address);
    validate_required("address", &address)?;
    validate_prefixed_hex("address", &address, ETH_ADDRESS_HEX_LEN)?;
    Ok(address.to_ascii_lowercase())
}

pub fn normalize_tx_hash(hash: &str) -> Result<String, ValidationError> {
    let hash = sanitize_string(hash);
    validate_required("tx_hash", &hash)?;
    validate_prefixed_hex("tx_hash", &hash, TX_HASH_HEX_LEN)?;
    Ok(hash.to_ascii_lowercase())
}

pub fn validate_positive_amount(amount: &BigDecimal) -> ValidationResult {
    if amount <= &BigDecimal::from(0) {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    Ok(())
}

pub fn validate_remark(remark: Option<&str>) -> ValidationResult {
    match remark {
        Some(remark) => validate_max_len("remark", remark, REMARK_MAX_LEN),
        None => Ok(()),
    }
}
