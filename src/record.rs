use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::EntityKind;
use crate::error::HarvestError;

/// Extra context carried with a batch of records across one stage boundary.
pub type AttachedParameters = BTreeMap<String, Value>;

/// One search hit (dataset or file).
///
/// The fields every stage relies on are typed; anything else the index
/// returns is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKind>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub data_node: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub index_node: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub checksum_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "many", skip_serializing_if = "Vec::is_empty")]
    pub url: Vec<String>,
    #[serde(default, deserialize_with = "many", skip_serializing_if = "Vec::is_empty")]
    pub variable: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_parameters: Option<AttachedParameters>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            instance_id: None,
            master_id: None,
            dataset_id: None,
            title: None,
            data_node: None,
            index_node: None,
            version: None,
            checksum: None,
            checksum_type: None,
            size: None,
            url: Vec::new(),
            variable: Vec::new(),
            attached_parameters: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Version-independent dataset identity, used to group and deduplicate.
    pub fn dataset_functional_id(&self) -> String {
        if let Some(value) = self.extra_str("dataset_functional_id") {
            return value;
        }
        match self.kind {
            Some(EntityKind::File) => self
                .dataset_id
                .as_deref()
                .map(strip_data_node)
                .unwrap_or_default()
                .to_string(),
            _ => self
                .instance_id
                .clone()
                .unwrap_or_else(|| strip_data_node(&self.id).to_string()),
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// First HTTP download endpoint, without the mime/service suffix.
    pub fn http_url(&self) -> Option<&str> {
        self.url
            .iter()
            .find(|entry| entry.ends_with("|HTTPServer"))
            .or_else(|| self.url.first())
            .and_then(|entry| entry.split('|').next())
    }

    pub fn dataset_version(&self) -> Option<String> {
        if let Some(value) = self.extra_str("dataset_version") {
            return Some(value);
        }
        let dataset = match self.kind {
            Some(EntityKind::File) => self.dataset_id.as_deref()?,
            _ => self.instance_id.as_deref().unwrap_or(&self.id),
        };
        let last = strip_data_node(dataset).rsplit('.').next()?;
        let digits = last.strip_prefix('v')?;
        (!digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
            .then(|| digits.to_string())
    }

    /// Replaces the variable list, as done when a dataset is known to be
    /// wanted for a specific set of variables only.
    pub fn set_variables(&mut self, variables: &[String]) {
        self.variable = variables.to_vec();
    }

    /// Deep-copies `params` into this record. A record crosses exactly one
    /// stage boundary, so a second attach is rejected.
    pub fn attach(&mut self, params: &AttachedParameters) -> Result<(), HarvestError> {
        if self.attached_parameters.is_some() {
            return Err(HarvestError::AlreadyAttached(self.id.clone()));
        }
        self.attached_parameters = Some(params.clone());
        Ok(())
    }

    /// Renders one report column. Unknown or absent attributes render empty.
    pub fn column(&self, name: &str) -> String {
        match name {
            "id" => self.id.clone(),
            "type" => self.kind.map(|kind| kind.to_string()).unwrap_or_default(),
            "instance_id" => self.instance_id.clone().unwrap_or_default(),
            "master_id" => self.master_id.clone().unwrap_or_default(),
            "dataset_id" => self.dataset_id.clone().unwrap_or_default(),
            "data_node" => self.data_node.clone().unwrap_or_default(),
            "index_node" => self.index_node.clone().unwrap_or_default(),
            "version" => self.version.clone().unwrap_or_default(),
            "checksum" => self.checksum.clone().unwrap_or_default(),
            "checksum_type" => self.checksum_type.clone().unwrap_or_default(),
            "size" => self.size.map(|size| size.to_string()).unwrap_or_default(),
            "url" => self.http_url().unwrap_or_default().to_string(),
            "variable" => self.variable.join(","),
            "filename" => self
                .extra_str("filename")
                .or_else(|| self.title.clone())
                .unwrap_or_default(),
            "dataset_functional_id" => self.dataset_functional_id(),
            "file_functional_id" => self
                .extra_str("file_functional_id")
                .or_else(|| self.instance_id.clone())
                .unwrap_or_default(),
            "dataset_version" => self.dataset_version().unwrap_or_default(),
            other => self.extra_str(other).unwrap_or_default(),
        }
    }

    fn extra_str(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(render_value)
    }
}

fn strip_data_node(id: &str) -> &str {
    id.split('|').next().unwrap_or(id)
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => {
            let parts = items.iter().filter_map(render_value).collect::<Vec<_>>();
            Some(parts.join(","))
        }
        other => Some(other.to_string()),
    }
}

// The index returns most attributes as single-element arrays.
fn scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.first().and_then(render_value),
        Some(other) => render_value(&other),
        None => None,
    })
}

fn many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.iter().filter_map(render_value).collect(),
        Some(other) => render_value(&other).into_iter().collect(),
        None => Vec::new(),
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = scalar(deserializer)?;
    value
        .map(|text| text.parse::<u64>().map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn file_doc() -> Value {
        json!({
            "id": "cmip5.output1.IPSL.IPSL-CM5A-LR.historical.day.atmos.day.r1i1p1.v20110101.tas_day.nc|vesg.ipsl.fr",
            "type": "File",
            "instance_id": "cmip5.output1.IPSL.IPSL-CM5A-LR.historical.day.atmos.day.r1i1p1.v20110101.tas_day.nc",
            "dataset_id": "cmip5.output1.IPSL.IPSL-CM5A-LR.historical.day.atmos.day.r1i1p1.v20110101|vesg.ipsl.fr",
            "title": "tas_day.nc",
            "size": 1024,
            "checksum": ["abc123"],
            "url": [
                "http://vesg.ipsl.fr/tas_day.nc.xml|application/xml+thredds|Catalog",
                "http://vesg.ipsl.fr/thredds/fileServer/tas_day.nc|application/netcdf|HTTPServer"
            ],
            "variable": ["tas"],
            "project": ["CMIP5"],
            "_version_": 1500000000000000001u64
        })
    }

    #[test]
    fn decode_index_document() {
        let record: Record = serde_json::from_value(file_doc()).unwrap();
        assert_eq!(record.kind, Some(EntityKind::File));
        assert_eq!(record.checksum.as_deref(), Some("abc123"));
        assert_eq!(record.size, Some(1024));
        assert_eq!(
            record.http_url(),
            Some("http://vesg.ipsl.fr/thredds/fileServer/tas_day.nc")
        );
        assert_eq!(record.column("project"), "CMIP5");
        assert_eq!(record.column("_version_"), "1500000000000000001");
        assert_eq!(record.column("filename"), "tas_day.nc");
    }

    #[test]
    fn file_functional_ids() {
        let record: Record = serde_json::from_value(file_doc()).unwrap();
        assert_eq!(
            record.dataset_functional_id(),
            "cmip5.output1.IPSL.IPSL-CM5A-LR.historical.day.atmos.day.r1i1p1.v20110101"
        );
        assert_eq!(record.dataset_version().as_deref(), Some("20110101"));
    }

    #[test]
    fn attach_is_deep_and_single_shot() {
        let mut params = AttachedParameters::new();
        params.insert("selection".to_string(), json!({"file": "cmip5.txt"}));

        let mut record = Record::new("f1");
        record.attach(&params).unwrap();
        params.insert("late".to_string(), json!(true));

        let attached = record.attached_parameters.as_ref().unwrap();
        assert!(!attached.contains_key("late"));

        let err = record.attach(&params).unwrap_err();
        assert_matches!(err, HarvestError::AlreadyAttached(id) if id == "f1");
    }

    #[test]
    fn missing_columns_render_empty() {
        let record = Record::new("d1");
        assert_eq!(record.column("checksum"), "");
        assert_eq!(record.column("cmor_table"), "");
    }
}
