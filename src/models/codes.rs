// src/models/codes.rs

//! Upstream code tables.
//!
//! The warning API reports categorical fields as numeric codes; these maps
//! resolve them to the labels used in outbound messages. Unknown codes fall
//! back to `UNKNOWN(field:code)` at the call site rather than failing the
//! cycle.

/// Warning kind (warnVar): label for a warning category code.
pub fn warn_kind_label(code: &str) -> Option<&'static str> {
    Some(match code {
        "1" => "강풍",
        "2" => "호우",
        "3" => "한파",
        "4" => "건조",
        "5" => "폭풍해일",
        "6" => "풍랑",
        "7" => "태풍",
        "8" => "대설",
        "9" => "황사",
        "12" => "폭염",
        _ => return None,
    })
}

/// Warning level (warnStress): advisory vs warning.
pub fn warn_level_label(code: &str) -> Option<&'static str> {
    Some(match code {
        "0" => "주의보",
        "1" => "경보",
        _ => return None,
    })
}

/// Bulletin command: announce, release, extend, correct, amend.
pub fn command_label(code: &str) -> Option<&'static str> {
    Some(match code {
        "1" => "발표",
        "2" => "해제",
        "3" => "연장",
        "6" => "정정",
        "7" => "변경발표",
        "8" => "변경해제",
        _ => return None,
    })
}

/// Cancellation flag.
pub fn cancel_label(code: &str) -> Option<&'static str> {
    Some(match code {
        "0" => "정상",
        "1" => "취소된 특보",
        _ => return None,
    })
}

/// The command label that denotes a fresh announcement.
pub const COMMAND_PUBLISH: &str = "발표";
/// The cancel label that denotes a non-cancelled bulletin.
pub const CANCEL_NORMAL: &str = "정상";

/// Human description of an API result code, for error messages.
pub fn result_code_description(code: &str) -> &'static str {
    match code {
        "00" => "정상 (NORMAL_CODE)",
        "01" => "어플리케이션 에러 (APPLICATION_ERROR)",
        "02" => "데이터베이스 에러 (DB_ERROR)",
        "03" => "데이터없음 에러 (NODATA_ERROR)",
        "04" => "HTTP 에러 (HTTP_ERROR)",
        "05" => "서비스 연결실패 에러 (SERVICETIMEOUT_ERROR)",
        "10" => "잘못된 요청 파라메터 에러 (INVALID_REQUEST_PARAMETER_ERROR)",
        "11" => "필수 요청 파라메터가 없음 (NO_MANDATORY_REQUEST_PARAMETERS_ERROR)",
        "12" => "해당 오픈API서비스가 없거나 폐기됨 (NO_OPENAPI_SERVICE_ERROR)",
        "20" => "서비스 접근거부 (SERVICE_ACCESS_DENIED_ERROR)",
        "21" => "일시적으로 사용할 수 없는 서비스 키 (TEMPORARILY_DISABLE_THE_SERVICEKEY_ERROR)",
        "22" => "서비스 요청제한횟수 초과 (LIMITED_NUMBER_OF_SERVICE_REQUESTS_EXCEEDS_ERROR)",
        "30" => "등록되지 않은 서비스키 (SERVICE_KEY_IS_NOT_REGISTERED_ERROR)",
        "31" => "기한만료된 서비스키 (DEADLINE_HAS_EXPIRED_ERROR)",
        "32" => "등록되지 않은 IP (UNREGISTERED_IP_ERROR)",
        "33" => "서명되지 않은 호출 (UNSIGNED_CALL_ERROR)",
        _ => "알 수 없는 응답 코드 (UNKNOWN_ERROR)",
    }
}

/// Result code for a successful response.
pub const RESULT_CODE_OK: &str = "00";
/// Result code for "no data" (empty page, not an error).
pub const RESULT_CODE_NODATA: &str = "03";
/// Result code for rate-limit exhaustion; retried like transport errors.
pub const RESULT_CODE_RATE_LIMITED: &str = "22";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_resolve() {
        assert_eq!(warn_kind_label("2"), Some("호우"));
        assert_eq!(warn_level_label("1"), Some("경보"));
        assert_eq!(command_label("1"), Some(COMMAND_PUBLISH));
        assert_eq!(cancel_label("0"), Some(CANCEL_NORMAL));
    }

    #[test]
    fn test_unknown_codes_yield_none() {
        assert_eq!(warn_kind_label("99"), None);
        assert_eq!(warn_level_label("5"), None);
        assert_eq!(command_label(""), None);
    }

    #[test]
    fn test_result_code_descriptions() {
        assert!(result_code_description("22").contains("LIMITED_NUMBER"));
        assert!(result_code_description("??").contains("UNKNOWN_ERROR"));
    }
}
