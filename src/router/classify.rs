//! Request classification.

use url::Url;

use crate::config::MutationRoute;
use crate::http::Request;
use crate::sync::SyncFamily;

/// Why a request skips the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
  /// Any method other than GET
  Mutation,
  /// A URL outside the application origin
  CrossOrigin,
}

/// Strategy class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Bypass(BypassReason),
  /// Same-origin API resource: network first, cache, then offline JSON
  Api,
  /// Same-origin page navigation: network first, cache, then offline page
  Navigation,
  /// Everything else: cache first, network on miss
  Asset,
}

/// Total function from a request to its strategy class.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  api_prefix: String,
  mutations: Vec<MutationRoute>,
}

impl Classifier {
  pub fn new(origin: Url, api_prefix: &str, mutations: Vec<MutationRoute>) -> Self {
    Self {
      origin,
      api_prefix: api_prefix.to_string(),
      mutations,
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Classify in precedence order: method, origin, API prefix, navigation, asset.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if !request.is_get() {
      return RequestClass::Bypass(BypassReason::Mutation);
    }
    if !self.is_same_origin(&request.url) {
      return RequestClass::Bypass(BypassReason::CrossOrigin);
    }
    if request.url.path().starts_with(&self.api_prefix) {
      return RequestClass::Api;
    }
    if request.accepts_html() {
      return RequestClass::Navigation;
    }
    RequestClass::Asset
  }

  /// Sync family for a same-origin mutating request, if its path is recognized.
  pub fn mutation_family(&self, request: &Request) -> Option<SyncFamily> {
    self.mutation_route(request).map(|route| route.family)
  }

  /// Collection a recognized mutation affects, re-read after a successful replay.
  pub fn refresh_url(&self, request: &Request) -> Option<Url> {
    let route = self.mutation_route(request)?;
    self.origin.join(&route.prefix).ok()
  }

  fn mutation_route(&self, request: &Request) -> Option<&MutationRoute> {
    if request.is_get() || !self.is_same_origin(&request.url) {
      return None;
    }
    let path = request.url.path();
    self
      .mutations
      .iter()
      .find(|route| path_has_prefix(path, &route.prefix))
  }
}

/// Segment-aware prefix match: `/api/chat` matches `/api/chat/1` but not `/api/chatter`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('/'),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RoutesConfig;

  fn classifier() -> Classifier {
    let routes = RoutesConfig::default();
    Classifier::new(
      Url::parse("http://localhost:3000").unwrap(),
      &routes.api_prefix,
      routes.mutations,
    )
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_method_takes_precedence() {
    let c = classifier();
    // Even a cross-origin POST is classified as a mutation first.
    let request = Request::new("POST", url("https://payments.example.com/charge"));
    assert_eq!(
      c.classify(&request),
      RequestClass::Bypass(BypassReason::Mutation)
    );
  }

  #[test]
  fn test_cross_origin_bypass() {
    let c = classifier();
    let request = Request::get(url("https://cdn.example.com/lib.js"));
    assert_eq!(
      c.classify(&request),
      RequestClass::Bypass(BypassReason::CrossOrigin)
    );
    // Different port is a different origin.
    let request = Request::get(url("http://localhost:4000/api/listings"));
    assert_eq!(
      c.classify(&request),
      RequestClass::Bypass(BypassReason::CrossOrigin)
    );
  }

  #[test]
  fn test_api_before_navigation() {
    let c = classifier();
    let request =
      Request::get(url("http://localhost:3000/api/listings")).with_header("Accept", "text/html");
    assert_eq!(c.classify(&request), RequestClass::Api);
  }

  #[test]
  fn test_navigation_and_assets() {
    let c = classifier();
    let page = Request::get(url("http://localhost:3000/listings/42"))
      .with_header("Accept", "text/html,application/xhtml+xml");
    assert_eq!(c.classify(&page), RequestClass::Navigation);

    let logo = Request::get(url("http://localhost:3000/static/logo.png"));
    assert_eq!(c.classify(&logo), RequestClass::Asset);
  }

  #[test]
  fn test_mutation_family() {
    let c = classifier();
    let post = Request::new("POST", url("http://localhost:3000/api/listings"));
    assert_eq!(c.mutation_family(&post), Some(SyncFamily::Listings));

    let put = Request::new("PUT", url("http://localhost:3000/api/messages/7"));
    assert_eq!(c.mutation_family(&put), Some(SyncFamily::Chat));

    let other = Request::new("POST", url("http://localhost:3000/api/rewards"));
    assert_eq!(c.mutation_family(&other), None);

    let lookalike = Request::new("POST", url("http://localhost:3000/api/chatter"));
    assert_eq!(c.mutation_family(&lookalike), None);

    let get = Request::get(url("http://localhost:3000/api/listings"));
    assert_eq!(c.mutation_family(&get), None);
  }

  #[test]
  fn test_refresh_url_is_route_collection() {
    let c = classifier();
    let put = Request::new("PUT", url("http://localhost:3000/api/listings/12"));
    assert_eq!(
      c.refresh_url(&put).map(String::from),
      Some("http://localhost:3000/api/listings".to_string())
    );
    let other = Request::new("DELETE", url("http://localhost:3000/api/rewards/3"));
    assert!(c.refresh_url(&other).is_none());
  }
}
