/// Script utilities: OP_RETURN payload decoding and collateral outpoint
/// parsing for the verbose JSON the daemon returns.

const OP_RETURN_PREFIX: &str = "OP_RETURN ";

/// Decode the hex payload that follows `OP_RETURN ` in a script asm string.
///
/// Each pair of hex digits becomes one character; decoding stops at a `00`
/// pair or at the end of the payload. Scripts without an OP_RETURN decode
/// to an empty string.
pub fn decode_message(asm: &str) -> String {
    let Some((_, payload)) = asm.split_once(OP_RETURN_PREFIX) else {
        return String::new();
    };
    let mut message = String::new();
    for pair in payload.as_bytes().chunks(2) {
        if pair == b"00" {
            break;
        }
        let digits = std::str::from_utf8(pair).unwrap_or_default();
        let byte = u8::from_str_radix(digits, 16).unwrap_or(0);
        message.push(byte as char);
    }
    message
}

/// True if the asm carries an OP_RETURN payload
#[inline]
pub fn is_op_return(asm: &str) -> bool {
    asm.contains(OP_RETURN_PREFIX)
}

/// Parse `COutPoint(<hash>, <index>)` into its parts
pub fn parse_collateral_outpoint(collateral: &str) -> Option<(String, u32)> {
    let inner = collateral
        .trim()
        .strip_prefix("COutPoint(")?
        .strip_suffix(')')?;
    let (hash, index) = inner.split_once(", ")?;
    let index = index.trim().parse().ok()?;
    Some((hash.trim().to_string(), index))
}

/// Encode a message as the asm the daemon would report, for fixtures
#[cfg(test)]
pub fn op_return_asm(message: &str) -> String {
    format!("{}{}", OP_RETURN_PREFIX, hex::encode(message))
}
