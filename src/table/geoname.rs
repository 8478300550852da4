// src/table/geoname.rs

/// Title-case a geography name.
///
/// A character is upper-cased when the character before it is not
/// alphabetic, and lower-cased otherwise, so `"BOX ELDER"` becomes
/// `"Box Elder"` and `"o'neil"` becomes `"O'Neil"`.
pub fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_alpha = false;
    for ch in raw.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}
