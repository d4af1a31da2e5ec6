// shroud/src/engine/headers.rs
//
// Per-dispatch header decoration. Stateless: header list in, header list out.
//
//   1. strip proxy / automation tells (X-Forwarded-For, X-Real-IP, Via,
//      X-Forwarded-Proto, X-Requested-With)
//   2. overwrite User-Agent from a rotation list
//   3. overwrite Accept from a variation list
//   4. independently, p = 0.5 each, add Accept-Encoding / Accept-Language /
//      Cache-Control / DNT when the caller has not set them
//   5. apply configured custom headers last, overwriting
//
// Arrival order is preserved: overwritten headers keep their slot, added
// headers go to the end.

use rand::Rng;

use crate::config::HeaderConfig;
use crate::events::Headers;

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

pub const ACCEPT_VARIANTS: &[&str] = &[
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    "application/json, text/plain, */*",
    "*/*",
];

const AUXILIARY: &[(&str, &[&str])] = &[
    ("Accept-Encoding", &["gzip, deflate, br", "gzip, deflate", "br, gzip"]),
    ("Accept-Language", &["en-US,en;q=0.9", "en-US,en;q=0.5", "en-GB,en;q=0.8"]),
    ("Cache-Control",   &["no-cache", "max-age=0"]),
    ("DNT",             &["1"]),
];

const AUXILIARY_P: f64 = 0.5;

const IDENTIFYING: &[&str] = &[
    "X-Forwarded-For",
    "X-Real-IP",
    "Via",
    "X-Forwarded-Proto",
    "X-Requested-With",
];

pub struct HeaderRandomizer;

impl HeaderRandomizer {
    pub fn randomize<R: Rng + ?Sized>(headers: &[(String, String)], policy: &HeaderConfig, rng: &mut R) -> Headers {
        let mut out = headers.to_vec();

        if policy.strip_identifying {
            out.retain(|(k, _)| !IDENTIFYING.iter().any(|h| h.eq_ignore_ascii_case(k)));
        }
        if policy.rotate_user_agent {
            set_header(&mut out, "User-Agent", pick(USER_AGENTS, rng));
        }
        if policy.vary_accept {
            set_header(&mut out, "Accept", pick(ACCEPT_VARIANTS, rng));
        }
        for (name, options) in AUXILIARY {
            if rng.gen_bool(AUXILIARY_P) && find(&out, name).is_none() {
                out.push((name.to_string(), pick(options, rng).to_string()));
            }
        }
        for (name, value) in &policy.custom {
            set_header(&mut out, name, value);
        }
        out
    }
}

fn pick<'a, R: Rng + ?Sized>(options: &[&'a str], rng: &mut R) -> &'a str {
    options[rng.gen_range(0..options.len())]
}

fn find(headers: &Headers, name: &str) -> Option<usize> {
    headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn set_header(headers: &mut Headers, name: &str, value: &str) {
    match find(headers, name) {
        Some(i) => headers[i].1 = value.to_string(),
        None    => headers.push((name.to_string(), value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn h(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
        find(headers, name).map(|i| headers[i].1.as_str())
    }

    #[test]
    fn rotates_user_agent_in_place() {
        let mut rng = StdRng::seed_from_u64(1);
        let input = h(&[("user-agent", "curl/8.0"), ("X-Custom", "1")]);
        let out = HeaderRandomizer::randomize(&input, &HeaderConfig::default(), &mut rng);
        assert_eq!(out[0].0, "user-agent");
        assert!(USER_AGENTS.contains(&out[0].1.as_str()));
        assert_eq!(value(&out, "x-custom"), Some("1"));
    }

    #[test]
    fn strips_identifying_headers() {
        let mut rng = StdRng::seed_from_u64(2);
        let input = h(&[
            ("x-forwarded-for", "10.0.0.1"),
            ("Via", "proxy"),
            ("X-Forwarded-Proto", "https"),
            ("X-Requested-With", "XMLHttpRequest"),
        ]);
        let out = HeaderRandomizer::randomize(&input, &HeaderConfig::default(), &mut rng);
        for name in IDENTIFYING {
            assert!(value(&out, name).is_none(), "{name} survived");
        }
    }

    #[test]
    fn disabled_policy_leaves_core_headers_alone() {
        let mut rng = StdRng::seed_from_u64(3);
        let policy = HeaderConfig {
            rotate_user_agent: false,
            vary_accept:       false,
            strip_identifying: false,
            custom:            Vec::new(),
        };
        let input = h(&[("User-Agent", "custom"), ("Via", "proxy")]);
        let out = HeaderRandomizer::randomize(&input, &policy, &mut rng);
        assert_eq!(value(&out, "User-Agent"), Some("custom"));
        assert_eq!(value(&out, "Via"), Some("proxy"));
        assert!(value(&out, "Accept").is_none());
    }

    #[test]
    fn auxiliary_headers_appear_about_half_the_time() {
        let mut rng = StdRng::seed_from_u64(4);
        let n = 2_000;
        let with_dnt = (0..n)
            .filter(|_| value(&HeaderRandomizer::randomize(&[], &HeaderConfig::default(), &mut rng), "DNT").is_some())
            .count();
        let ratio = with_dnt as f64 / n as f64;
        assert!(ratio > 0.4 && ratio < 0.6, "ratio={ratio}");
    }

    #[test]
    fn custom_headers_are_applied_last() {
        let mut rng = StdRng::seed_from_u64(6);
        let policy = HeaderConfig {
            custom: h(&[("X-Client", "blocker"), ("user-agent", "pinned/1.0"), ("DNT", "0")]),
            ..HeaderConfig::default()
        };
        let input = h(&[("User-Agent", "curl/8.0"), ("x-client", "old")]);
        for _ in 0..50 {
            let out = HeaderRandomizer::randomize(&input, &policy, &mut rng);
            assert_eq!(value(&out, "X-Client"), Some("blocker"));
            assert_eq!(value(&out, "User-Agent"), Some("pinned/1.0"));
            assert_eq!(value(&out, "dnt"), Some("0"));
            assert_eq!(out.iter().filter(|(k, _)| k.eq_ignore_ascii_case("x-client")).count(), 1);
        }
    }

    #[test]
    fn caller_auxiliary_values_are_kept() {
        let mut rng = StdRng::seed_from_u64(5);
        let input = h(&[("Accept-Language", "de-DE")]);
        for _ in 0..50 {
            let out = HeaderRandomizer::randomize(&input, &HeaderConfig::default(), &mut rng);
            assert_eq!(value(&out, "accept-language"), Some("de-DE"));
        }
    }
}
