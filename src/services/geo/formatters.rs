use super::types::LookupResult;

/// Placeholder for a field the source did not return
pub const UNKNOWN_FIELD: &str = "unknown";

/// Rendered text for a local record without a city
pub const UNKNOWN_CITY: &str = "an unknown city";

/// Rendered text for an address no source knows about
pub const UNKNOWN_LOCATION: &str = "an unknown location";

/// Neutral text used when no lookup source is usable
pub const NO_GEO_DATA: &str = "No geolocation data available";

const NO_IP: &str = "No IP found!!";

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(UNKNOWN_FIELD)
}

/// Render a remote result
pub fn render_remote(result: &LookupResult) -> String {
    if !result.found {
        return UNKNOWN_LOCATION.to_string();
    }

    format!(
        "City: {}, Region: {}, Country: {}, Org: {}",
        field(&result.city),
        field(&result.region),
        field(&result.country),
        field(&result.organization)
    )
}

/// Render a local database result
pub fn render_local(result: &LookupResult) -> String {
    match (&result.city, result.found) {
        (_, false) => UNKNOWN_LOCATION.to_string(),
        (Some(city), true) => format!("City: {}", city),
        (None, true) => UNKNOWN_CITY.to_string(),
    }
}

/// The text of a 320 line for `target` given a rendered location
pub fn connecting_from_line(target: &str, rendered: &str) -> String {
    format!("{} :is connecting from {}", target, rendered)
}

pub fn no_ip_line(target: &str) -> String {
    format!("{} :{}", target, NO_IP)
}

pub fn no_data_line(target: &str) -> String {
    format!("{} :{}", target, NO_GEO_DATA)
}
