//! The web-stack topology as a ready-made plan.
//!
//! Network with public and private subnets in two zones, internet and NAT
//! gateways, routing, security groups, private web instances behind a load
//! balancer, and a public bastion. A database and an object-store bucket are
//! optional.

use serde_json::json;

use crate::error::PlanError;
use crate::plan::{ConvergencePlan, ResourceKind, ResourceSpec};

/// Database settings. No `Default`: the master password always comes from
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseOptions {
    pub identifier: String,
    pub engine: String,
    pub instance_class: String,
    pub allocated_storage_gb: u64,
    pub master_username: String,
    pub master_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebStackOptions {
    /// Prefix for provider-side names.
    pub name: String,
    pub cidr_block: String,
    pub zones: [String; 2],
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub key_path: String,
    pub require_local_key: bool,
    pub health_check_path: String,
    pub database: Option<DatabaseOptions>,
    pub bucket: Option<String>,
}

impl Default for WebStackOptions {
    fn default() -> Self {
        Self {
            name: "web".to_string(),
            cidr_block: "10.0.0.0/16".to_string(),
            zones: ["zone-a".to_string(), "zone-b".to_string()],
            image_id: "image-web".to_string(),
            instance_type: "small".to_string(),
            key_name: "web-key".to_string(),
            key_path: "keys/web-key.pem".to_string(),
            require_local_key: true,
            health_check_path: "/health".to_string(),
            database: None,
            bucket: None,
        }
    }
}

/// Builds the web-stack [`ConvergencePlan`].
#[derive(Debug, Clone, Default)]
pub struct WebStackBlueprint {
    options: WebStackOptions,
}

impl WebStackBlueprint {
    pub fn new(options: WebStackOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WebStackOptions {
        &self.options
    }

    pub fn build(&self) -> Result<ConvergencePlan, PlanError> {
        let o = &self.options;
        let named = |suffix: &str| format!("{}-{}", o.name, suffix);
        let mut specs = vec![
            ResourceSpec::new(ResourceKind::KeyPair, "key")
                .attr("key_name", o.key_name.as_str())
                .attr("key_path", o.key_path.as_str())
                .attr("require_local_material", o.require_local_key),
            ResourceSpec::new(ResourceKind::Network, "vpc")
                .attr("name", o.name.as_str())
                .attr("cidr_block", o.cidr_block.as_str())
                .attr("enable_dns_support", true)
                .attr("enable_dns_hostnames", true),
        ];

        let subnets = [
            ("public-a", 1, &o.zones[0], true),
            ("public-b", 2, &o.zones[1], true),
            ("private-a", 3, &o.zones[0], false),
            ("private-b", 4, &o.zones[1], false),
        ];
        for (logical, octet, zone, public) in subnets {
            specs.push(
                ResourceSpec::new(ResourceKind::Subnet, logical)
                    .attr("name", named(logical))
                    .reference("network_id", "vpc")
                    .attr("cidr_block", subnet_cidr(&o.cidr_block, octet))
                    .attr("availability_zone", zone.as_str())
                    .attr("public", public),
            );
        }

        specs.extend([
            ResourceSpec::new(ResourceKind::InternetGateway, "igw").reference("network_id", "vpc"),
            ResourceSpec::new(ResourceKind::NatGateway, "nat")
                .reference("subnet_id", "public-a")
                .depend("igw"),
            ResourceSpec::new(ResourceKind::RouteTable, "public-rt")
                .attr("name", named("public"))
                .reference("network_id", "vpc"),
            ResourceSpec::new(ResourceKind::Route, "public-default")
                .reference("route_table_id", "public-rt")
                .attr("destination", "0.0.0.0/0")
                .reference("gateway_id", "igw"),
            ResourceSpec::new(ResourceKind::RouteTable, "private-rt")
                .attr("name", named("private"))
                .reference("network_id", "vpc"),
            ResourceSpec::new(ResourceKind::Route, "private-default")
                .reference("route_table_id", "private-rt")
                .attr("destination", "0.0.0.0/0")
                .reference("nat_gateway_id", "nat"),
        ]);

        for (subnet, table) in [
            ("public-a", "public-rt"),
            ("public-b", "public-rt"),
            ("private-a", "private-rt"),
            ("private-b", "private-rt"),
        ] {
            specs.push(
                ResourceSpec::new(ResourceKind::RouteTableAssociation, format!("{}-assoc", subnet))
                    .reference("route_table_id", table)
                    .reference("subnet_id", subnet),
            );
        }

        specs.extend([
            ResourceSpec::new(ResourceKind::SecurityGroup, "public-sg")
                .attr("name", named("public"))
                .reference("network_id", "vpc")
                .attr("description", "HTTP and SSH from anywhere")
                .attr(
                    "ingress",
                    json!([
                        {"protocol": "tcp", "port": 80, "cidr": "0.0.0.0/0"},
                        {"protocol": "tcp", "port": 22, "cidr": "0.0.0.0/0"},
                    ]),
                ),
            ResourceSpec::new(ResourceKind::SecurityGroup, "private-sg")
                .attr("name", named("private"))
                .reference("network_id", "vpc")
                .attr("description", "SSH, HTTP and ICMP from inside the network")
                .attr(
                    "ingress",
                    json!([
                        {"protocol": "tcp", "port": 22, "cidr": o.cidr_block},
                        {"protocol": "tcp", "port": 80, "cidr": o.cidr_block},
                        {"protocol": "icmp", "port": -1, "cidr": o.cidr_block},
                    ]),
                ),
        ]);

        for (logical, subnet) in [("web-1", "private-a"), ("web-2", "private-b")] {
            specs.push(
                self.instance(logical, subnet, "private-sg")
                    .depend(&format!("{}-assoc", subnet)),
            );
        }
        specs.push(self.instance("bastion", "public-a", "public-sg").depend("public-a-assoc"));

        specs.extend([
            ResourceSpec::new(ResourceKind::LoadBalancer, "lb")
                .attr("name", named("lb"))
                .reference_list("subnet_ids", &["public-a", "public-b"])
                .reference_list("security_group_ids", &["public-sg"])
                .depend("igw"),
            ResourceSpec::new(ResourceKind::TargetGroup, "tg")
                .attr("name", named("tg"))
                .reference("network_id", "vpc")
                .attr("protocol", "HTTP")
                .attr("port", 80)
                .attr("health_check_path", o.health_check_path.as_str())
                .attr("health_check_interval", 30)
                .attr("health_check_timeout", 5)
                .attr("healthy_threshold", 3)
                .attr("unhealthy_threshold", 3)
                .attr("health_check_matcher", "200"),
            ResourceSpec::new(ResourceKind::Listener, "listener")
                .reference("load_balancer_id", "lb")
                .attr("protocol", "HTTP")
                .attr("port", 80)
                .reference("target_group_id", "tg"),
            ResourceSpec::new(ResourceKind::TargetRegistration, "tg-targets")
                .reference("target_group_id", "tg")
                .reference_list("targets", &["web-1", "web-2"]),
        ]);

        if let Some(db) = &o.database {
            specs.extend([
                ResourceSpec::new(ResourceKind::DbSubnetGroup, "db-subnets")
                    .attr("name", named("db"))
                    .attr("description", "Private subnets for the database")
                    .reference_list("subnet_ids", &["private-a", "private-b"]),
                ResourceSpec::new(ResourceKind::DatabaseInstance, "db")
                    .attr("identifier", db.identifier.as_str())
                    .attr("engine", db.engine.as_str())
                    .attr("instance_class", db.instance_class.as_str())
                    .attr("allocated_storage", db.allocated_storage_gb)
                    .attr("master_username", db.master_username.as_str())
                    .attr("master_password", db.master_password.as_str())
                    .attr("db_subnet_group_name", named("db"))
                    .depend("db-subnets")
                    .reference_list("security_group_ids", &["private-sg"]),
            ]);
        }

        if let Some(bucket) = &o.bucket {
            specs.push(
                ResourceSpec::new(ResourceKind::ObjectStoreBucket, "bucket")
                    .attr("bucket", bucket.as_str()),
            );
        }

        ConvergencePlan::new(specs)
    }

    fn instance(&self, logical: &str, subnet: &str, group: &str) -> ResourceSpec {
        let o = &self.options;
        ResourceSpec::new(ResourceKind::Instance, logical)
            .attr("name", format!("{}-{}", o.name, logical))
            .attr("image_id", o.image_id.as_str())
            .attr("instance_type", o.instance_type.as_str())
            .attr("key_name", o.key_name.as_str())
            .depend("key")
            .reference("subnet_id", subnet)
            .reference_list("security_group_ids", &[group])
    }
}

/// `/24` number `octet` inside a `/16` network, e.g. `10.0.0.0/16`, 3 ->
/// `10.0.3.0/24`. Other inputs are returned with the octet appended.
fn subnet_cidr(network: &str, octet: u8) -> String {
    let base = network.split('/').next().unwrap_or(network);
    let parts: Vec<&str> = base.split('.').collect();
    match parts.as_slice() {
        [a, b, _, _] => format!("{}.{}.{}.0/24", a, b, octet),
        _ => format!("{}-{}", network, octet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> DatabaseOptions {
        DatabaseOptions {
            identifier: "web-db".to_string(),
            engine: "postgres".to_string(),
            instance_class: "db.small".to_string(),
            allocated_storage_gb: 20,
            master_username: "app".to_string(),
            master_password: "s3cret-value".to_string(),
        }
    }

    #[test]
    fn test_default_topology() {
        let plan = WebStackBlueprint::default().build().unwrap();
        assert_eq!(plan.len(), 25);
        assert!(plan.get("db").is_none());
        assert!(plan.get("bucket").is_none());

        let order = plan.topological_order().unwrap();
        let pos = |name: &str| {
            let idx = plan.position(name).unwrap();
            order.iter().position(|&i| i == idx).unwrap()
        };
        assert!(pos("vpc") < pos("public-a"));
        assert!(pos("igw") < pos("nat"));
        assert!(pos("nat") < pos("private-default"));
        assert!(pos("web-1") < pos("tg-targets"));
        assert!(pos("lb") < pos("listener"));
    }

    #[test]
    fn test_subnets_span_both_zones() {
        let plan = WebStackBlueprint::default().build().unwrap();
        let a = plan.get("private-a").unwrap();
        let b = plan.get("private-b").unwrap();
        assert_eq!(a.attributes.get_str("cidr_block"), Some("10.0.3.0/24"));
        assert_eq!(a.attributes.get_str("availability_zone"), Some("zone-a"));
        assert_eq!(b.attributes.get_str("availability_zone"), Some("zone-b"));
        assert_eq!(a.attributes.get_bool("public"), Some(false));
    }

    #[test]
    fn test_network_and_health_check_settings() {
        let plan = WebStackBlueprint::default().build().unwrap();

        let vpc = &plan.get("vpc").unwrap().attributes;
        assert_eq!(vpc.get_bool("enable_dns_support"), Some(true));
        assert_eq!(vpc.get_bool("enable_dns_hostnames"), Some(true));

        let tg = &plan.get("tg").unwrap().attributes;
        assert_eq!(tg.get_str("health_check_path"), Some("/health"));
        assert_eq!(tg.get("health_check_interval"), Some(&json!(30)));
        assert_eq!(tg.get("health_check_timeout"), Some(&json!(5)));
        assert_eq!(tg.get("healthy_threshold"), Some(&json!(3)));
        assert_eq!(tg.get("unhealthy_threshold"), Some(&json!(3)));
        assert_eq!(tg.get_str("health_check_matcher"), Some("200"));
    }

    #[test]
    fn test_private_group_admits_network_traffic_only() {
        let plan = WebStackBlueprint::default().build().unwrap();
        let private = plan.get("private-sg").unwrap();
        assert_eq!(
            private.attributes.get("ingress"),
            Some(&json!([
                {"protocol": "tcp", "port": 22, "cidr": "10.0.0.0/16"},
                {"protocol": "tcp", "port": 80, "cidr": "10.0.0.0/16"},
                {"protocol": "icmp", "port": -1, "cidr": "10.0.0.0/16"},
            ]))
        );
        assert_eq!(private.depends_on, vec!["vpc"]);
    }

    #[test]
    fn test_optional_database_and_bucket() {
        let plan = WebStackBlueprint::new(WebStackOptions {
            database: Some(database()),
            bucket: Some("web-assets".to_string()),
            ..Default::default()
        })
        .build()
        .unwrap();

        assert_eq!(plan.len(), 28);
        let db = plan.get("db").unwrap();
        assert_eq!(db.depends_on, vec!["db-subnets", "private-sg"]);
        assert!(!db.attributes.to_string().contains("s3cret-value"));
        assert_eq!(
            plan.get("bucket").unwrap().attributes.get_str("bucket"),
            Some("web-assets")
        );
    }

    #[test]
    fn test_key_toggle_is_carried() {
        let plan = WebStackBlueprint::new(WebStackOptions {
            require_local_key: false,
            ..Default::default()
        })
        .build()
        .unwrap();
        let key = plan.get("key").unwrap();
        assert_eq!(key.attributes.get_bool("require_local_material"), Some(false));
    }

    #[test]
    fn test_plan_json_round_trips() {
        let plan = WebStackBlueprint::default().build().unwrap();
        let json = plan.to_json_pretty().unwrap();
        let parsed = ConvergencePlan::from_json(&json).unwrap();
        assert_eq!(parsed.specs(), plan.specs());
    }

    #[test]
    fn test_subnet_cidr() {
        assert_eq!(subnet_cidr("10.1.0.0/16", 2), "10.1.2.0/24");
    }
}
