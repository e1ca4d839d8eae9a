use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::limiter::{BucketStore, LimiterError};
use crate::subnets::{Decision, SubnetHolder};

/// The three orthogonal counting axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Login,
    Password,
    Ip,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Login => "login",
            Dimension::Password => "password",
            Dimension::Ip => "ip",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub limit: u32,
    pub window: Duration,
}

pub type LimitRules = HashMap<Dimension, Rule>;

/// Applies the configured per-dimension rules against the counter store.
/// A dimension without a configured rule is denied outright rather than
/// skipped, so a configuration gap cannot silently disable a limit.
pub struct LimitChecker {
    store: Arc<dyn BucketStore>,
    rules: LimitRules,
}

impl LimitChecker {
    pub fn new(store: Arc<dyn BucketStore>, rules: LimitRules) -> LimitChecker {
        LimitChecker { store, rules }
    }

    pub async fn allow(&self, dimension: Dimension, ident: &str) -> Result<bool, LimiterError> {
        let rule = match self.rules.get(&dimension) {
            Some(rule) => rule,
            None => return Ok(false),
        };
        self.store
            .allow(&bucket_key(dimension, ident), rule.limit, rule.window)
            .await
    }

    pub async fn reset(&self, dimension: Dimension, ident: &str) -> Result<(), LimiterError> {
        // Reset works even for dimensions without a configured rule.
        self.store.reset(&bucket_key(dimension, ident)).await
    }
}

fn bucket_key(dimension: Dimension, ident: &str) -> String {
    format!("{}:{}", dimension.as_str(), ident)
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// The decision cascade consulted for every login attempt: deny list, allow
/// list, then the login, password and IP windows in that order, stopping at
/// the first deny.
pub struct RateLimitService {
    subnets: Arc<SubnetHolder>,
    checker: LimitChecker,
}

impl RateLimitService {
    pub fn new(subnets: Arc<SubnetHolder>, checker: LimitChecker) -> RateLimitService {
        RateLimitService { subnets, checker }
    }

    pub async fn check(
        &self,
        login: &str,
        password: &str,
        ip: IpAddr,
    ) -> Result<bool, LimiterError> {
        match self.subnets.check(ip) {
            Decision::Deny => return Ok(false),
            Decision::Allow => return Ok(true),
            Decision::Continue => {}
        }

        let password_hash = hash_password(password);

        if !self.checker.allow(Dimension::Login, login).await? {
            return Ok(false);
        }
        if !self.checker.allow(Dimension::Password, &password_hash).await? {
            return Ok(false);
        }
        if !self.checker.allow(Dimension::Ip, &ip.to_string()).await? {
            return Ok(false);
        }

        Ok(true)
    }

    pub async fn reset(
        &self,
        login: &str,
        password: &str,
        ip: IpAddr,
    ) -> Result<(), LimiterError> {
        self.checker.reset(Dimension::Login, login).await?;
        self.checker
            .reset(Dimension::Password, &hash_password(password))
            .await?;
        self.checker.reset(Dimension::Ip, &ip.to_string()).await?;
        Ok(())
    }
}
