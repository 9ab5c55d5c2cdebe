use url::Url;

/// Browser the client presents itself as.
///
/// The accounts and web player front ends serve different markup to
/// unknown agents, so this must look like a desktop Chrome.
const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,

    pub device_name: String,

    pub user_agent: String,

    /// Additional attempts for requests that fail in transit.
    pub http_retries: u32,

    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let user_agent = CHROME_USER_AGENT.to_owned();
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            app_lang: "en".to_owned(),

            device_name: "Web Player (Chrome)".to_owned(),

            user_agent,

            http_retries: 3,

            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_endpoints(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }
}

/// Origins of every remote service the client talks to.
///
/// Each entry ends in `/` so that paths can be joined onto it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    /// Login, password reset and challenge completion pages.
    pub accounts: Url,

    /// Web player entry page and access token endpoint.
    pub open: Url,

    /// Cookie synchronisation pixel.
    pub pixel: Url,

    /// Primary CDN prefix of the web player bundle.
    pub cdn: Url,

    /// Fallback CDN prefix of the web player bundle.
    pub cdn_fallback: Url,

    /// Client token exchange.
    pub client_token: Url,

    /// Device registration and connect-state.
    pub spclient: Url,

    /// Interactive challenge service.
    pub challenge: Url,

    /// Marketing site hosting the signup page.
    pub www: Url,

    /// Account creation API.
    pub signup: Url,

    /// Realtime WebSocket endpoint.
    pub dealer: Url,

    /// Versioned proof secrets as `{version: [byte, ...]}`.
    pub secrets: Url,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            accounts: endpoint("https://accounts.spotify.com/"),
            open: endpoint("https://open.spotify.com/"),
            pixel: endpoint("https://pixel.spotify.com/"),
            cdn: endpoint("https://open.spotifycdn.com/cdn/build/web-player/"),
            cdn_fallback: endpoint("https://open-exp.spotifycdn.com/cdn/build/web-player/"),
            client_token: endpoint("https://clienttoken.spotify.com/"),
            spclient: endpoint("https://gue1-spclient.spotify.com/"),
            challenge: endpoint("https://challenge.spotify.com/"),
            www: endpoint("https://www.spotify.com/"),
            signup: endpoint("https://spclient.wg.spotify.com/"),
            dealer: endpoint("wss://dealer.spotify.com/"),
            secrets: endpoint(
                "https://raw.githubusercontent.com/Thereallo1026/spotify-secrets/main/secrets/secretDict.json",
            ),
        }
    }
}

impl Endpoints {
    /// Points every service at a single origin.
    ///
    /// Paths are kept distinct per service, so one server can answer for
    /// all of them. The realtime endpoint switches to `ws`/`wss` to match
    /// the scheme of `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` cannot be a base URL.
    #[must_use]
    pub fn single_origin(base: &Url) -> Self {
        let join = |path: &str| base.join(path).expect("path is relative");

        let mut dealer = base.clone();
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        dealer
            .set_scheme(scheme)
            .expect("http origin can switch to ws");

        Self {
            accounts: base.clone(),
            open: base.clone(),
            pixel: base.clone(),
            cdn: join("cdn/build/web-player/"),
            cdn_fallback: join("cdn-exp/build/web-player/"),
            client_token: base.clone(),
            spclient: base.clone(),
            challenge: base.clone(),
            www: base.clone(),
            signup: base.clone(),
            dealer,
            secrets: join("secrets/secretDict.json"),
        }
    }

    /// Hosts that share the session cookies.
    #[must_use]
    pub fn cookie_origins(&self) -> Vec<&Url> {
        let mut origins: Vec<&Url> = Vec::new();
        for url in [
            &self.accounts,
            &self.open,
            &self.www,
            &self.spclient,
            &self.challenge,
            &self.signup,
            &self.pixel,
        ] {
            if !origins.iter().any(|seen| seen.host() == url.host()) {
                origins.push(url);
            }
        }
        origins
    }
}

fn endpoint(url: &str) -> Url {
    Url::parse(url).expect("endpoint url is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_origin_keeps_paths_apart() {
        let base = Url::parse("http://127.0.0.1:4000/").unwrap();
        let endpoints = Endpoints::single_origin(&base);

        assert_eq!(endpoints.dealer.as_str(), "ws://127.0.0.1:4000/");
        assert_eq!(
            endpoints.cdn.as_str(),
            "http://127.0.0.1:4000/cdn/build/web-player/"
        );
        assert_eq!(endpoints.cookie_origins().len(), 1);
    }

    #[test]
    fn production_cookies_cover_every_host() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.cookie_origins().len(), 7);
    }
}
