// Copyright 2025 FlowerPower Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use config::utils::json;
use infra::errors::{Error, Result};

/// Which of a schedule's accumulated results to return: an index, a
/// `start:end` slice, a list of indices, or `all` / `latest` / `earliest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSelector {
    Index(usize),
    Slice(usize, usize),
    List(Vec<usize>),
    All,
    Latest,
    Earliest,
}

impl std::str::FromStr for ResultSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "all" => return Ok(ResultSelector::All),
            "latest" => return Ok(ResultSelector::Latest),
            "earliest" => return Ok(ResultSelector::Earliest),
            _ => {}
        }
        if let Some((start, end)) = s.split_once(':') {
            let start = start
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid slice: {s}")))?;
            let end = end
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid slice: {s}")))?;
            return Ok(ResultSelector::Slice(start, end));
        }
        if s.contains(',') {
            let indices: Result<Vec<usize>> = s
                .split(',')
                .map(|i| {
                    i.trim()
                        .parse()
                        .map_err(|_| Error::InvalidArgument(format!("invalid index list: {s}")))
                })
                .collect();
            return Ok(ResultSelector::List(indices?));
        }
        s.parse()
            .map(ResultSelector::Index)
            .map_err(|_| Error::InvalidArgument(format!("invalid result selector: {s}")))
    }
}

impl ResultSelector {
    pub fn apply(&self, results: Vec<json::Value>) -> Vec<json::Value> {
        match self {
            ResultSelector::All => results,
            ResultSelector::Latest => results.into_iter().last().into_iter().collect(),
            ResultSelector::Earliest => results.into_iter().next().into_iter().collect(),
            ResultSelector::Index(i) => results.into_iter().nth(*i).into_iter().collect(),
            ResultSelector::Slice(start, end) => results
                .into_iter()
                .skip(*start)
                .take(end.saturating_sub(*start))
                .collect(),
            ResultSelector::List(indices) => {
                let mut out = Vec::new();
                for &i in indices {
                    if let Some(v) = results.get(i) {
                        out.push(v.clone());
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<json::Value> {
        (0..5).map(|i| json::json!(i)).collect()
    }

    #[test]
    fn test_parse() {
        assert_eq!("all".parse::<ResultSelector>().unwrap(), ResultSelector::All);
        assert_eq!(
            "latest".parse::<ResultSelector>().unwrap(),
            ResultSelector::Latest
        );
        assert_eq!(
            "1:3".parse::<ResultSelector>().unwrap(),
            ResultSelector::Slice(1, 3)
        );
        assert_eq!(
            "0,2,4".parse::<ResultSelector>().unwrap(),
            ResultSelector::List(vec![0, 2, 4])
        );
        assert_eq!("2".parse::<ResultSelector>().unwrap(), ResultSelector::Index(2));
        assert!("bogus".parse::<ResultSelector>().is_err());
    }

    #[test]
    fn test_apply() {
        assert_eq!(ResultSelector::All.apply(values()).len(), 5);
        assert_eq!(ResultSelector::Latest.apply(values()), vec![json::json!(4)]);
        assert_eq!(
            ResultSelector::Earliest.apply(values()),
            vec![json::json!(0)]
        );
        assert_eq!(
            ResultSelector::Slice(1, 3).apply(values()),
            vec![json::json!(1), json::json!(2)]
        );
        assert_eq!(
            ResultSelector::List(vec![0, 4, 9]).apply(values()),
            vec![json::json!(0), json::json!(4)]
        );
        assert_eq!(ResultSelector::Index(9).apply(values()), Vec::<json::Value>::new());
    }
}
