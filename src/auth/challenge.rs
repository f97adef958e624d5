#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    MissingRealm,
    Unrecognized(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn parse(header: &str) -> Result<Challenge, Error> {
    let trimmed = header.trim();
    if let Some(rest) = strip_scheme(trimmed, "Bearer") {
        let params = parse_params(rest);
        let realm = params
            .iter()
            .find(|(k, _)| *k == "realm")
            .map(|(_, v)| v.to_string())
            .ok_or(Error::MissingRealm)?;
        let service = params
            .iter()
            .find(|(k, _)| *k == "service")
            .map(|(_, v)| v.to_string());
        let scope = params
            .iter()
            .find(|(k, _)| *k == "scope")
            .map(|(_, v)| v.to_string());
        Ok(Challenge::Bearer {
            realm,
            service,
            scope,
        })
    } else if strip_scheme(trimmed, "Basic").is_some() {
        Ok(Challenge::Basic)
    } else {
        Err(Error::Unrecognized(header.to_string()))
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    let rest = input.strip_prefix(scheme)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(' ').map(str::trim_start)
    }
}

fn parse_params(input: &str) -> Vec<(&str, &str)> {
    use nom::{
        IResult, Parser,
        bytes::complete::{tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, separated_list0},
        sequence::{delimited, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        separated_list0(
            terminated(tag(","), many0(tag(" "))),
            separated_pair(
                alpha1,
                tag("="),
                delimited(char('"'), take_until1("\""), char('"')),
            ),
        )
        .parse(input)
    }
    parser(input).map(|(_, v)| v).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_with_all_fields() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#;
        let challenge = parse(header).unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:samalba/my-app:pull,push".to_string()),
            }
        );
    }

    #[test]
    fn parses_bearer_without_service() {
        let header = r#"Bearer realm="https://example.com/token",scope="repository:a/b:pull""#;
        let challenge = parse(header).unwrap();
        match challenge {
            Challenge::Bearer { service, .. } => assert_eq!(service, None),
            _ => panic!("expected bearer"),
        }
    }

    #[test]
    fn parses_basic() {
        assert_eq!(parse(r#"Basic realm="registry""#).unwrap(), Challenge::Basic);
    }

    #[test]
    fn missing_realm_is_an_error() {
        let header = r#"Bearer service="registry.docker.io""#;
        assert!(matches!(parse(header).unwrap_err(), Error::MissingRealm));
    }
}
