// Copyright 2025 Quarry Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Query parameters
//!
//! Parameters are a plain record: `$name` in an expression reads the
//! `name` field of the record passed to `query`. The [`params!`] macro
//! builds one inline.

/// Build a parameter record from `"name" => value` pairs
///
/// ```
/// use quarry::params;
///
/// let p = params! { "min" => 100, "label" => "fruit" };
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => { $crate::core::Record::new() };
    ( $($name:expr => $value:expr),+ $(,)? ) => {
        $crate::record! { $($name => $value),+ }
    };
}
