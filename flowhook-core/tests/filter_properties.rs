// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Property tests for the event matcher

use flowhook_core::{matches, Event, EventFilter};
use proptest::prelude::*;

fn event_type() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "Shotgun_Version_Change",
        "Shotgun_Task_Change",
        "Shotgun_Project_Change",
        "Shotgun_HumanUser_Change",
    ])
    .prop_map(str::to_string)
}

fn attribute() -> impl Strategy<Value = Option<String>> {
    prop::option::of(
        prop::sample::select(vec!["sg_status_list", "sg_status", "description", "projects"])
            .prop_map(str::to_string),
    )
}

fn event() -> impl Strategy<Value = Event> {
    (1i64..1_000_000, event_type(), attribute()).prop_map(|(id, event_type, attribute)| {
        let event = Event::new(id, event_type);
        match attribute {
            Some(name) => event.with_attribute(name),
            None => event,
        }
    })
}

proptest! {
    #[test]
    fn absent_filter_matches_every_event(event in event()) {
        prop_assert!(matches(&event, None));
    }

    #[test]
    fn empty_filter_matches_no_event(event in event()) {
        prop_assert!(!matches(&event, Some(&EventFilter::new())));
    }

    #[test]
    fn type_only_entry_matches_any_attribute(event in event()) {
        let filter = EventFilter::new().on_type(event.event_type.clone());
        prop_assert!(filter.matches(&event));
    }

    #[test]
    fn attribute_entry_requires_exact_attribute(
        event in event(),
        filter_type in event_type(),
        filter_attr in "[a-z_]{1,16}",
    ) {
        let filter = EventFilter::new().on_attributes(filter_type.clone(), [filter_attr.clone()]);
        let expected = event.event_type == filter_type
            && event.attribute_name.as_deref() == Some(filter_attr.as_str());
        prop_assert_eq!(filter.matches(&event), expected);
    }

    #[test]
    fn matching_is_deterministic(event in event(), filter_type in event_type()) {
        let filter = EventFilter::new().on_attributes(filter_type, ["sg_status_list"]);
        prop_assert_eq!(filter.matches(&event), filter.matches(&event.clone()));
    }
}
