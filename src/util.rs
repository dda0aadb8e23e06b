/// Authority of a uri for logs; requests without one still need a label.
pub(crate) fn authority_of(uri: &http::Uri) -> String {
    match uri.authority() {
        Some(authority) => authority.to_string(),
        None => "<no authority>".to_owned(),
    }
}
